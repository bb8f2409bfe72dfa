use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use log::debug;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes configuration not found: {0}")]
    ConfigurationNotFound(String),

    #[error("invalid Kubernetes credentials: {0}")]
    InvalidCredentials(KubeconfigError),

    #[error("unable to create Kubernetes client: {0}")]
    ConnectionSetupFailed(kube::Error),
}

/// `$HOME/.kube/config`
pub fn default_kubeconfig_path() -> Result<PathBuf, Error> {
    home::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| Error::ConfigurationNotFound("no home directory".to_string()))
}

/// Builds a client from the kubeconfig at `path`, or from the default
/// location when no path is given. Nothing is sent to the cluster yet.
pub async fn connect(path: Option<&Path>) -> Result<kube::Client, Error> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_kubeconfig_path()?,
    };
    if !path.is_file() {
        return Err(Error::ConfigurationNotFound(path.display().to_string()));
    }
    debug!("Loading kubeconfig from {}", path.display());

    let kubeconfig = Kubeconfig::read_from(&path).map_err(Error::InvalidCredentials)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(Error::InvalidCredentials)?;
    debug!("Using Kubernetes API server {}", config.cluster_url);

    kube::Client::try_from(config).map_err(Error::ConnectionSetupFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_kubeconfig(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("catalog-connector-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn missing_file_is_configuration_not_found() {
        let path = std::env::temp_dir().join("catalog-connector-does-not-exist");
        let err = connect(Some(&path)).await.err().unwrap();
        assert!(matches!(err, Error::ConfigurationNotFound(_)));
    }

    #[tokio::test]
    async fn unparsable_file_is_invalid_credentials() {
        let path = write_kubeconfig("garbage", "{ this is: [not yaml");
        let err = connect(Some(&path)).await.err().unwrap();
        assert!(matches!(err, Error::InvalidCredentials(_)));
    }

    #[tokio::test]
    async fn kubeconfig_without_context_is_invalid_credentials() {
        let path = write_kubeconfig(
            "no-context",
            "apiVersion: v1\nkind: Config\nclusters: []\ncontexts: []\nusers: []\n",
        );
        let err = connect(Some(&path)).await.err().unwrap();
        assert!(matches!(err, Error::InvalidCredentials(_)));
    }

    #[tokio::test]
    async fn valid_kubeconfig_builds_a_client_without_contacting_the_cluster() {
        let path = write_kubeconfig(
            "valid",
            r#"apiVersion: v1
kind: Config
current-context: test
clusters:
  - name: test
    cluster:
      server: http://127.0.0.1:6443
contexts:
  - name: test
    context:
      cluster: test
      user: test
      namespace: default
users:
  - name: test
    user:
      token: abc123
"#,
        );
        let client = connect(Some(&path)).await.unwrap();
        assert_eq!(client.default_namespace(), "default");
    }
}
