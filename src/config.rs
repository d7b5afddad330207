use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Server settings, read once from `VETBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Pending notices per clinic before new ones are dropped.
    pub outbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "vetbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            outbox_capacity: 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "VETBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("VETBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("VETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("VETBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "VETBOOK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "VETBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "VETBOOK_METRICS_PORT"),
            tls_cert: lookup("VETBOOK_TLS_CERT"),
            tls_key: lookup("VETBOOK_TLS_KEY"),
            outbox_capacity: parsed(&lookup, "VETBOOK_OUTBOX_CAPACITY")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.outbox_capacity),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Certificate and key paths, if TLS is configured. Setting only one is an error.
    fn tls_files(&self) -> io::Result<Option<(&str, &str)>> {
        match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both VETBOOK_TLS_CERT and VETBOOK_TLS_KEY must be set, or neither",
            )),
        }
    }

    /// Build the TLS acceptor from the configured PEM files. `None` serves plaintext.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let Some((cert_path, key_path)) = self.tls_files()? else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("no certificate found in {cert_path}"),
            ));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, format!("no private key found in {key_path}"))
            })?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        server.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(server))))
    }
}

/// A variable parsed as `T`, or `None` if unset or unparseable.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn values_override_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("VETBOOK_PORT", "6000"),
            ("VETBOOK_BIND", "127.0.0.1"),
            ("VETBOOK_DATA_DIR", "/var/lib/vetbook"),
            ("VETBOOK_METRICS_PORT", "9100"),
            ("VETBOOK_OUTBOX_CAPACITY", "16"),
        ]));
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/vetbook"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.outbox_capacity, 16);
    }

    #[test]
    fn garbage_falls_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("VETBOOK_PORT", "not-a-port"),
            ("VETBOOK_MAX_CONNECTIONS", "-3"),
            ("VETBOOK_OUTBOX_CAPACITY", "0"),
        ]));
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.outbox_capacity, 1024);
    }

    #[test]
    fn tls_needs_both_files() {
        let plain = Config::default();
        assert!(plain.tls_acceptor().unwrap().is_none());

        let half = Config::from_lookup(lookup_from(&[("VETBOOK_TLS_CERT", "/etc/vetbook/cert.pem")]));
        let err = half.tls_acceptor().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_certificate_file_is_reported() {
        let config = Config::from_lookup(lookup_from(&[
            ("VETBOOK_TLS_CERT", "/nonexistent/vetbook/cert.pem"),
            ("VETBOOK_TLS_KEY", "/nonexistent/vetbook/key.pem"),
        ]));
        let err = config.tls_acceptor().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
