//! [`ClusterApi`] over the `kubectl` binary.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cluster::{ClusterApi, ClusterError, KubeMeta, Pod, Postgresql, Secret};
use crate::runner::{CommandRunner, CommandSpec};

/// Location of the `kubectl` binary and the kubeconfig it should use.
#[derive(Debug, Clone)]
pub struct Kubectl {
    pub binary: PathBuf,
    pub kubeconfig: Option<PathBuf>,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            kubeconfig: None,
        }
    }
}

impl Kubectl {
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(&self.binary);
        if let Some(kubeconfig) = &self.kubeconfig {
            spec = spec.arg(format!("--kubeconfig={}", kubeconfig.display()));
        }
        spec.args(args)
    }
}

#[derive(Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct Named {
    metadata: KubeMeta,
}

pub struct KubectlClusterApi {
    kubectl: Kubectl,
    runner: Arc<dyn CommandRunner>,
}

impl KubectlClusterApi {
    pub fn new(kubectl: Kubectl, runner: Arc<dyn CommandRunner>) -> Self {
        Self { kubectl, runner }
    }

    async fn run(
        &self,
        kind: &str,
        name: &str,
        args: Vec<String>,
        input: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, ClusterError> {
        let spec = self.kubectl.command(args);
        debug!(command = %spec.label(), kind, name, "Calling kubectl");
        let running = self.runner.spawn(&spec).await?;
        running
            .output(input.as_deref())
            .await
            .map_err(|e| classify(kind, name, e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<T, ClusterError> {
        let args = strings(["get", kind, "-n", namespace, name, "-o", "json"]);
        let raw = self
            .run(kind, &format!("{namespace}/{name}"), args, None)
            .await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn create_json<T: Serialize + DeserializeOwned>(
        &self,
        kind: &str,
        object: &T,
        display: &str,
    ) -> Result<T, ClusterError> {
        let body = serde_json::to_vec(object)?;
        let args = strings(["create", "-f", "-", "-o", "json"]);
        let raw = self.run(kind, display, args, Some(body)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Maps kubectl's error output onto the API error kinds.
fn classify(kind: &str, name: &str, message: String) -> ClusterError {
    if message.contains("NotFound") || message.contains("not found") {
        ClusterError::not_found(kind, name)
    } else if message.contains("AlreadyExists") || message.contains("already exists") {
        ClusterError::already_exists(kind, name)
    } else {
        ClusterError::Api(message)
    }
}

#[async_trait]
impl ClusterApi for KubectlClusterApi {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let raw = self
            .run("namespaces", "*", strings(["get", "namespaces", "-o", "json"]), None)
            .await?;
        let list: ObjectList<Named> = serde_json::from_slice(&raw)?;
        Ok(list.items.into_iter().map(|n| n.metadata.name).collect())
    }

    #[instrument(skip(self))]
    async fn list_postgresqls(&self, namespace: &str) -> Result<Vec<Postgresql>, ClusterError> {
        let args = strings(["get", "postgresqls", "-n", namespace, "-o", "json"]);
        let raw = self.run("postgresqls", namespace, args, None).await?;
        let list: ObjectList<Postgresql> = serde_json::from_slice(&raw)?;
        Ok(list.items)
    }

    async fn create_postgresql(&self, postgresql: &Postgresql) -> Result<Postgresql, ClusterError> {
        self.create_json("postgresql", postgresql, &postgresql.qualified_name())
            .await
    }

    async fn delete_postgresql(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let args = strings(["delete", "postgresql", "-n", namespace, name, "--wait=false"]);
        self.run("postgresql", &format!("{namespace}/{name}"), args, None)
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.get_json("secret", namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let display = format!("{}/{}", secret.metadata.namespace, secret.metadata.name);
        self.create_json("secret", secret, &display).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.get_json("pod", namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutcome;
    use crate::test_utils::ScriptedRunner;

    fn api(runner: Arc<ScriptedRunner>) -> KubectlClusterApi {
        KubectlClusterApi::new(
            Kubectl {
                binary: "kubectl".into(),
                kubeconfig: Some("/etc/kube/config".into()),
            },
            runner,
        )
    }

    #[tokio::test]
    async fn test_list_postgresqls_parses_items() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(
            br#"{"items":[{"metadata":{"name":"acid-a","namespace":"db","uid":"u-1"},"spec":{"teamId":"acid"}}]}"#,
        );
        let found = api(runner.clone()).list_postgresqls("db").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.uid.as_deref(), Some("u-1"));
        assert_eq!(
            runner.invocations()[0],
            vec![
                "--kubeconfig=/etc/kube/config",
                "get",
                "postgresqls",
                "-n",
                "db",
                "-o",
                "json"
            ]
        );
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(
            b"",
            CommandOutcome::failure(1, "Error from server (NotFound): secrets \"x\" not found"),
        );
        runner.push(
            b"",
            CommandOutcome::failure(1, "Error from server (AlreadyExists): secrets \"x\" already exists"),
        );
        runner.push(b"", CommandOutcome::failure(1, "Unable to connect to the server"));
        let api = api(runner.clone());

        assert!(api.get_secret("db", "x").await.unwrap_err().is_not_found());
        let secret = Secret::with_credentials("db", "x", "u", "p");
        assert!(api.create_secret(&secret).await.unwrap_err().is_already_exists());
        assert!(matches!(
            api.get_pod("db", "x-0").await.unwrap_err(),
            ClusterError::Api(_)
        ));
        assert_eq!(runner.stdin_of(1), serde_json::to_vec(&secret).unwrap());
    }
}
