use std::time::Duration;

use depot_config::config::Config;
use ureq::{Agent, Proxy};

use crate::error::{RegistryError, Result};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub user_agent: Option<String>,
    pub proxy: Option<Proxy>,
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: Some(format!("depot/{}", env!("CARGO_PKG_VERSION"))),
            proxy: None,
            timeout: None,
        }
    }
}

impl ClientConfig {
    /// Client settings shared by every uplink in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let proxy = config
            .http_proxy
            .as_deref()
            .map(|proxy| {
                Proxy::new(proxy).map_err(|err| RegistryError::InvalidUrl(format!("{proxy}: {err}")))
            })
            .transpose()?;

        Ok(Self {
            user_agent: Some(config.user_agent()),
            proxy,
            timeout: None,
        })
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// Builds an HTTP `Agent` configured from this `ClientConfig`.
    ///
    /// Non-2xx statuses are returned as responses, not errors, so callers can
    /// tell `304 Not Modified` and registry errors apart from transport
    /// failures.
    pub fn build(&self) -> Agent {
        let mut config = Agent::config_builder()
            .http_status_as_error(false)
            .proxy(self.proxy.clone())
            .timeout_global(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            config = config.user_agent(user_agent);
        }

        config.build().into()
    }
}
