// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use tokio_rustls::TlsAcceptor;

use trojan_tunnel::server::{Server, ServerContext};
use trojan_tunnel::tls::TlsConfig;

fn main() {
    simple_logger::init().unwrap();
    log::set_max_level(LevelFilter::Info);

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            log::warn!("no config file path provided, using config.json");
            String::from("config.json")
        }
    };

    fn run_with_path(path: String) -> io::Result<()> {
        let file = File::open(path)?;
        let cfg: Config = match serde_json::from_reader(file) {
            Ok(c) => c,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        cfg.run()
    }

    if let Err(e) = run_with_path(path) {
        log::error!("exited unexpectedly: {}", e);
    }
}

#[derive(serde::Deserialize)]
pub struct Config {
    log_level: log::LevelFilter,

    listen: Vec<SocketAddr>,

    secret: String,
    #[serde(default)]
    buffer_size: Option<usize>,
    #[serde(default = "default_dial_timeout")]
    upstream_dial_timeout: u64,
    #[serde(default)]
    udp_bind_address: Option<SocketAddr>,

    tls: TlsConfig,
}

fn default_dial_timeout() -> u64 {
    8
}

impl Config {
    fn run(self) -> io::Result<()> {
        log::set_max_level(self.log_level);

        let tls = TlsAcceptor::from(self.tls.build()?);

        let mut ctx = match self.buffer_size {
            Some(n) => ServerContext::with_buffer_size(self.secret.as_bytes(), n),
            None => ServerContext::new(self.secret.as_bytes()),
        };
        ctx.dial_timeout = Duration::from_secs(self.upstream_dial_timeout);
        ctx.udp_bind = self.udp_bind_address;
        let ctx = Arc::new(ctx);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        for bind in self.listen {
            let server = Server {
                bind,
                tls: tls.clone(),
                ctx: ctx.clone(),
            };
            rt.spawn(async move {
                if let Err(e) = server.run().await {
                    log::error!("server fatal {}", e);
                }
            });
        }

        rt.block_on(tokio::signal::ctrl_c())?;
        log::info!("SIGINT received, exiting...");
        ctx.shutdown.cancel();

        Ok(())
    }
}
