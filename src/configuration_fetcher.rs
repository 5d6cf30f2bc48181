//! An HTTP loader that fetches flag definitions from the configuration service.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{StatusCode, Url};

use crate::{
    configuration_loader::{ConfigurationLoader, LoadFuture, LoadOutcome},
    flag::FlagDefinition,
    Error, Result,
};

/// Configuration for [`ConfigurationFetcher`].
#[derive(Debug, Clone)]
pub struct ConfigurationFetcherConfig {
    /// Base URL of the configuration service, e.g. `https://flags.example.com/api`.
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout. The cache applies its own deadline on top.
    ///
    /// Defaults to [`ConfigurationFetcherConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub request_timeout: Duration,
}

impl ConfigurationFetcherConfig {
    /// Default value for [`ConfigurationFetcherConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> ConfigurationFetcherConfig {
        ConfigurationFetcherConfig {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: ConfigurationFetcherConfig::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Update request timeout with `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> ConfigurationFetcherConfig {
        self.request_timeout = timeout;
        self
    }
}

const FLAGS_ENDPOINT: &str = "flags";

/// A loader that fetches one flag definition per request: `GET {base_url}/flags/{key}`.
pub struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: ConfigurationFetcherConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl ConfigurationFetcher {
    /// # Errors
    ///
    /// Returns [`Error::Network`] if the HTTP client cannot be initialized.
    pub fn new(config: ConfigurationFetcherConfig) -> Result<ConfigurationFetcher> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(ConfigurationFetcher {
            client,
            config,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn flag_url(&self, flag_key: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url).map_err(Error::InvalidBaseUrl)?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(FLAGS_ENDPOINT)
            .push(flag_key);
        url.query_pairs_mut()
            .append_pair("apiKey", &self.config.api_key)
            .append_pair("engineVersion", env!("CARGO_PKG_VERSION"));
        Ok(url)
    }

    async fn fetch_flag(&self, flag_key: &str) -> Result<LoadOutcome> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.flag_url(flag_key)?;

        log::debug!(target: "toggle", flag_key; "fetching flag definition");
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                log::debug!(target: "toggle", flag_key; "flag not found");
                return Ok(LoadOutcome::NotFound);
            }
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "toggle", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                return Err(Error::Unauthorized);
            }
            _ => {}
        }

        let response = response.error_for_status().map_err(|err| {
            log::warn!(target: "toggle", flag_key; "received non-200 response while fetching flag definition: {:?}", err);
            Error::from(err)
        })?;

        let body = response.bytes().await?;
        let definition: FlagDefinition = serde_json::from_slice(&body)?;

        log::debug!(target: "toggle", flag_key, version = definition.version; "successfully fetched flag definition");

        Ok(LoadOutcome::Found(definition))
    }
}

impl ConfigurationLoader for ConfigurationFetcher {
    fn load<'a>(&'a self, flag_key: &'a str) -> LoadFuture<'a> {
        Box::pin(self.fetch_flag(flag_key))
    }
}
