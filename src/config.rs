//! Configuration, credential, and TLS material loading.
//!
//! Everything here is read once at service start. Secrets live in one file
//! per value (the container runtime mounts them read-only) and TLS material
//! lives in a well-known certs directory shared by every service.

use crate::error::{ConfigError, Result};

use std::path::{Path, PathBuf};

/// Process-wide configuration for a scheduler or worker instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one file per secret (`broker_user`, `mongo_db`, ...).
    pub secrets_dir: PathBuf,

    /// Directory holding the CA file and host certificate material.
    pub certs_dir: PathBuf,

    /// Root under which playbooks and job scripts are staged.
    pub app_root: PathBuf,

    /// Broker endpoint.
    pub broker: BrokerEndpoint,

    /// Store endpoint.
    pub store: StoreEndpoint,

    /// Bind address for the control API.
    pub api_bind: std::net::SocketAddr,

    /// Number of publisher pool members in the scheduler service.
    pub publisher_pool_size: usize,

    /// Number of consumer threads in the worker service.
    pub worker_pool_size: usize,
}

/// Broker host and port. TLS is always on; the port is the AMQPS port.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

/// Store host and port. TLS is always on.
#[derive(Debug, Clone)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from the environment, falling back to the
    /// container deployment defaults.
    pub fn load() -> Result<Self> {
        let secrets_dir = env_path("DOCK_SCHEDULE_SECRETS_DIR", "/run/secrets");
        let certs_dir = env_path("DOCK_SCHEDULE_CERTS_DIR", "/app");
        let app_root = env_path("DOCK_SCHEDULE_APP_ROOT", "/app");

        let api_bind = std::env::var("DOCK_SCHEDULE_API_BIND")
            .unwrap_or_else(|_| "0.0.0.0:6000".into())
            .parse()
            .map_err(|error| {
                ConfigError::Invalid(format!("invalid control API bind address: {error}"))
            })?;

        Ok(Self {
            secrets_dir,
            certs_dir,
            app_root,
            broker: BrokerEndpoint {
                host: std::env::var("DOCK_SCHEDULE_BROKER_HOST").unwrap_or_else(|_| "broker".into()),
                port: 5671,
            },
            store: StoreEndpoint {
                host: std::env::var("DOCK_SCHEDULE_STORE_HOST")
                    .unwrap_or_else(|_| "mongodb".into()),
                port: 27017,
            },
            api_bind,
            publisher_pool_size: 3,
            worker_pool_size: 3,
        })
    }

    /// Directory containing orchestration playbooks.
    pub fn playbook_dir(&self) -> PathBuf {
        self.app_root.join("ansible/playbooks")
    }

    /// Runner configuration file passed to every run.
    pub fn runner_config(&self) -> PathBuf {
        self.app_root.join("ansible/ansible.cfg")
    }

    /// Private key the runner uses to reach remote hosts.
    pub fn runner_private_key(&self) -> PathBuf {
        self.app_root.join("ansible/.env/.ansible_rsa")
    }

    /// TLS material paths under the certs directory.
    pub fn tls(&self) -> TlsMaterial {
        TlsMaterial::new(&self.certs_dir)
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Broker credentials read from the secrets directory.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub user: String,
    pub passwd: String,
    pub vhost: String,
}

impl BrokerCredentials {
    pub fn load(secrets_dir: &Path) -> Result<Self> {
        Ok(Self {
            user: read_secret(secrets_dir, "broker_user")?,
            passwd: read_secret(secrets_dir, "broker_passwd")?,
            vhost: read_secret(secrets_dir, "broker_vhost")?,
        })
    }
}

/// Store credentials read from the secrets directory.
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    pub user: String,
    pub passwd: String,
    pub db: String,
}

impl StoreCredentials {
    pub fn load(secrets_dir: &Path) -> Result<Self> {
        Ok(Self {
            user: read_secret(secrets_dir, "mongo_user")?,
            passwd: read_secret(secrets_dir, "mongo_passwd")?,
            db: read_secret(secrets_dir, "mongo_db")?,
        })
    }
}

fn read_secret(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    let value = std::fs::read_to_string(&path).map_err(|source| ConfigError::Secret {
        path: path.display().to_string(),
        source,
    })?;
    Ok(value.trim().to_string())
}

/// Paths to the process-wide TLS material. Loaded once; never mutated.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// CA certificate used to verify peers.
    pub ca_file: PathBuf,

    /// Host certificate.
    pub cert_file: PathBuf,

    /// Host private key.
    pub key_file: PathBuf,

    /// Combined host certificate + key PEM (the store client wants one file).
    pub combined_pem: PathBuf,

    /// PKCS#12 bundle of the host identity (the broker client wants DER).
    /// Emitted by the cluster bootstrapper alongside the PEM material.
    pub pkcs12: PathBuf,
}

impl TlsMaterial {
    pub fn new(certs_dir: &Path) -> Self {
        Self {
            ca_file: certs_dir.join("ca.crt"),
            cert_file: certs_dir.join("host.crt"),
            key_file: certs_dir.join("host.key"),
            combined_pem: certs_dir.join("host.pem"),
            pkcs12: certs_dir.join("host.p12"),
        }
    }

    /// Read the CA certificate PEM as a string.
    pub fn ca_pem(&self) -> Result<String> {
        read_material(&self.ca_file)
    }

    /// Read the PKCS#12 host identity bundle.
    pub fn pkcs12_der(&self) -> Result<Vec<u8>> {
        let bytes = std::fs::read(&self.pkcs12).map_err(|source| ConfigError::TlsMaterial {
            path: self.pkcs12.display().to_string(),
            source,
        })?;
        Ok(bytes)
    }
}

fn read_material(path: &Path) -> Result<String> {
    let value = std::fs::read_to_string(path).map_err(|source| ConfigError::TlsMaterial {
        path: path.display().to_string(),
        source,
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_trimmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broker_user"), "scheduler\n").expect("write secret");
        std::fs::write(dir.path().join("broker_passwd"), "  hunter2  \n").expect("write secret");
        std::fs::write(dir.path().join("broker_vhost"), "/jobs\n").expect("write secret");

        let creds = BrokerCredentials::load(dir.path()).expect("credentials should load");
        assert_eq!(creds.user, "scheduler");
        assert_eq!(creds.passwd, "hunter2");
        assert_eq!(creds.vhost, "/jobs");
    }

    #[test]
    fn missing_secret_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = StoreCredentials::load(dir.path()).expect_err("missing secrets must fail");
        assert!(error.to_string().contains("mongo_user"));
    }

    #[test]
    fn tls_material_paths_derive_from_certs_dir() {
        let tls = TlsMaterial::new(Path::new("/app"));
        assert_eq!(tls.ca_file, Path::new("/app/ca.crt"));
        assert_eq!(tls.combined_pem, Path::new("/app/host.pem"));
        assert_eq!(tls.pkcs12, Path::new("/app/host.p12"));
    }
}
