//! In-memory stand-ins for the cluster API and the process runner.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::AsyncWrite;
use warden_common::DataReader;

use crate::cluster::{ClusterApi, ClusterError, KubeMeta, Pod, PodStatus, Postgresql, Secret};
use crate::runner::{CommandOutcome, CommandRunner, CommandSpec, CommandStdin, RunningCommand};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    postgresqls: BTreeMap<Key, Postgresql>,
    secrets: BTreeMap<Key, Secret>,
    pods: BTreeMap<Key, Pod>,
    created_postgresqls: usize,
}

/// Cluster whose objects live in memory. Creating a postgresql assigns a uid and
/// starts its first pod in the configured phase.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    new_pod_phase: Mutex<String>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            new_pod_phase: Mutex::new("Running".to_string()),
        }
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_new_pod_phase(&self, phase: &str) {
        *self
            .new_pod_phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = phase.to_string();
    }

    /// Adds an existing cluster together with its superuser credentials.
    pub fn add_cluster(&self, mut postgresql: Postgresql, password: &str) -> Postgresql {
        if postgresql.metadata.uid.is_none() {
            postgresql.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        let namespace = postgresql.namespace().to_string();
        let name = postgresql.name().to_string();
        self.add_secret(Secret::with_credentials(
            &namespace,
            &crate::cluster::credentials_secret_name("postgres", &name),
            "postgres",
            password,
        ));
        let mut state = self.lock();
        state.namespaces.insert(namespace.clone());
        state
            .postgresqls
            .insert(key(&namespace, &name), postgresql.clone());
        postgresql
    }

    pub fn add_secret(&self, secret: Secret) {
        let mut state = self.lock();
        state.namespaces.insert(secret.metadata.namespace.clone());
        state.secrets.insert(
            key(&secret.metadata.namespace, &secret.metadata.name),
            secret,
        );
    }

    pub fn postgresql(&self, namespace: &str, name: &str) -> Option<Postgresql> {
        self.lock().postgresqls.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn postgresql_names(&self) -> Vec<String> {
        self.lock()
            .postgresqls
            .keys()
            .map(|(ns, name)| format!("{ns}/{name}"))
            .collect()
    }

    pub fn created_postgresqls(&self) -> usize {
        self.lock().created_postgresqls
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.lock().namespaces.iter().cloned().collect())
    }

    async fn list_postgresqls(&self, namespace: &str) -> Result<Vec<Postgresql>, ClusterError> {
        Ok(self
            .lock()
            .postgresqls
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pg)| pg.clone())
            .collect())
    }

    async fn create_postgresql(&self, postgresql: &Postgresql) -> Result<Postgresql, ClusterError> {
        let phase = self
            .new_pod_phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let mut state = self.lock();
        let k = key(postgresql.namespace(), postgresql.name());
        if state.postgresqls.contains_key(&k) {
            return Err(ClusterError::already_exists("postgresql", postgresql.qualified_name()));
        }
        let mut created = postgresql.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        state.namespaces.insert(k.0.clone());
        state.created_postgresqls += 1;

        let pod_name = created.primary_pod();
        state.pods.insert(
            key(&k.0, &pod_name),
            Pod {
                metadata: KubeMeta::new(&k.0, &pod_name),
                status: Some(PodStatus { phase: Some(phase) }),
            },
        );
        state.postgresqls.insert(k, created.clone());
        Ok(created)
    }

    async fn delete_postgresql(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.lock()
            .postgresqls
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("postgresql", format!("{namespace}/{name}")))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.secret(namespace, name)
            .ok_or_else(|| ClusterError::not_found("secret", format!("{namespace}/{name}")))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        let mut state = self.lock();
        if state.secrets.contains_key(&k) {
            return Err(ClusterError::already_exists("secret", format!("{}/{}", k.0, k.1)));
        }
        state.secrets.insert(k, secret.clone());
        Ok(secret.clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.lock()
            .pods
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::not_found("pod", format!("{namespace}/{name}")))
    }
}

type Responder = Box<dyn Fn(&CommandSpec) -> (Vec<u8>, CommandOutcome) + Send + Sync>;

/// Runner that answers from a queue of scripted results, then from an optional
/// responder, and otherwise succeeds with empty output. Everything written to a
/// command's stdin is kept.
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<(Vec<u8>, CommandOutcome)>>,
    responder: Option<Responder>,
    invocations: Mutex<Vec<Vec<String>>>,
    stdins: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(
        responder: impl Fn(&CommandSpec) -> (Vec<u8>, CommandOutcome) + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    pub fn push(&self, stdout: &[u8], outcome: CommandOutcome) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back((stdout.to_vec(), outcome));
    }

    pub fn push_output(&self, stdout: &[u8]) {
        self.push(stdout, CommandOutcome::success());
    }

    /// Arguments of every spawned command, in spawn order.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Bytes written to the stdin of the `index`th spawned command.
    pub fn stdin_of(&self, index: usize) -> Vec<u8> {
        self.stdins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(index)
            .map(|buf| buf.lock().unwrap_or_else(|p| p.into_inner()).clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn spawn(&self, spec: &CommandSpec) -> io::Result<RunningCommand> {
        let scripted = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let (stdout, outcome) = match (scripted, &self.responder) {
            (Some(result), _) => result,
            (None, Some(responder)) => responder(spec),
            (None, None) => (Vec::new(), CommandOutcome::success()),
        };

        let captured = Arc::new(Mutex::new(Vec::new()));
        self.invocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(spec.args.clone());
        self.stdins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(captured.clone());

        Ok(RunningCommand::new(
            spec.label(),
            Some(Box::pin(CaptureWriter(captured)) as CommandStdin),
            Some(Box::pin(io::Cursor::new(stdout)) as DataReader),
            futures::future::ready(Ok(outcome)).boxed(),
        ))
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Value of a `--env NAME=value` pair in a command's arguments.
pub fn env_arg<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("{name}=");
    args.windows(2)
        .find(|pair| pair[0] == "--env" && pair[1].starts_with(&prefix))
        .map(|pair| &pair[1][prefix.len()..])
}
