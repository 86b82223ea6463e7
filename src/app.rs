use crate::config::load_config;
use crate::proxy::Gateway;
use crate::state::ProxyState;
use log::{error, info};
use pingora::prelude::*;
use pingora::server::configuration::ServerConf;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct App {
    config_path: PathBuf,
}

impl App {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn run(self) {
        let config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        };

        let bind_addr = config.server.bind_addr.clone();

        let mut conf = ServerConf::default();
        conf.upstream_keepalive_pool_size = config.transport.max_idle_conns;

        let mut server = Server::new_with_opt_and_conf(None, conf);
        server.bootstrap();

        let state = Arc::new(ProxyState::new(config));
        for (host, rule) in &state.config.hosts {
            info!(
                "host {} -> {} (requests: {}, per_second: {})",
                host, rule.destination, rule.requests, rule.per_second
            );
        }

        let mut service = http_proxy_service(
            &server.configuration,
            Gateway {
                state: state.clone(),
            },
        );
        service.add_tcp(&bind_addr);
        info!("Gateway server running on {} (HTTP)", bind_addr);

        server.add_service(service);
        server.run_forever();
    }
}
