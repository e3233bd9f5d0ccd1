use crate::error::{ErrorKind, TapError};
use crate::executor::TaskPool;
use crate::id::Tid;
use crate::log;
use crate::manifest::{FunctionConfig, Manifest};
use crate::request::{ExecuteArgs, Reply, RequestKind};
use crate::run::rw::{self, Connection};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// The state one daemon owns locally: its name, its manifest and its task
/// pool. Both roles carry one; the slave serves every request against it,
/// the master uses it when a request names the master itself.
pub struct Node {
    name: String,
    manifest: RwLock<Manifest>,
    manifest_file: PathBuf,
    /// manifest root; codebase globs and pushed paths resolve against it
    root: PathBuf,
    /// role string used for fraction merging on reload: the slave reloads
    /// under its own name, the master under none
    reload_role: String,
    tasks: TaskPool,
}

impl Node {
    pub fn new(
        name: String,
        manifest: Manifest,
        manifest_file: impl AsRef<Path>,
        reload_role: String,
    ) -> Self {
        let manifest_file = manifest_file.as_ref().to_path_buf();
        let root = manifest_file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            name,
            manifest: RwLock::new(manifest),
            manifest_file,
            root,
            reload_role,
            tasks: TaskPool::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.read().clone()
    }

    /// The `client`-role dispatch: every request the node can serve
    /// against its own manifest and task pool. The slave passes its stream
    /// so `sync_code` can run the push session; the master passes `None`
    /// when handling a request addressed to itself.
    pub async fn handle_client(
        &self,
        kind: RequestKind,
        args: Value,
        conn: Option<&mut Connection>,
    ) -> Result<Reply, TapError> {
        match kind {
            RequestKind::Describe => Ok(self.describe()),
            RequestKind::Info => self.info(&args),
            RequestKind::Reload => self.reload(),
            RequestKind::Warmup => Ok(self.warmup()),
            RequestKind::Execute => self.execute(args),
            RequestKind::Fetch => self.fetch(&args),
            RequestKind::SyncCode => match conn {
                Some(conn) => self.recv_codebase(conn, &args).await,
                None => Err(TapError::new(
                    ErrorKind::InvalidRequest,
                    "Cannot sync code to the master itself.",
                )),
            },
            RequestKind::ListAll | RequestKind::BatchExecute => {
                Err(TapError::new(
                    ErrorKind::InvalidRequest,
                    format!(
                        "Request \"{}\" is not served by a client.",
                        kind.name()
                    ),
                ))
            }
        }
    }

    fn describe(&self) -> Reply {
        let manifest = self.manifest.read();
        let functions: serde_json::Map<String, Value> = manifest
            .functions
            .iter()
            .map(|(name, config)| {
                (name.clone(), Value::String(config.description.clone()))
            })
            .collect();
        Value::Object(functions)
    }

    fn info(&self, args: &Value) -> Result<Reply, TapError> {
        let function = required_str(args, "function")?;
        let manifest = self.manifest.read();
        let config = manifest.functions.get(function).ok_or_else(|| {
            TapError::new(
                ErrorKind::InvalidRequest,
                format!("Function \"{}\" is unknown.", function),
            )
        })?;
        serde_json::to_value(config).map_err(|e| {
            TapError::new(ErrorKind::Unknown, format!("{}", e))
        })
    }

    fn reload(&self) -> Result<Reply, TapError> {
        let manifest = Manifest::load(&self.manifest_file, &self.reload_role)
            .map_err(|e| {
                TapError::new(ErrorKind::Unknown, format!("{:#}", e))
            })?;
        *self.manifest.write() = manifest;
        log!("manifest reloaded");
        Ok(json!({"res": true}))
    }

    fn warmup(&self) -> Reply {
        let config = FunctionConfig {
            commands: self.manifest.read().warmup.clone(),
            ..FunctionConfig::default()
        };
        let tid =
            self.tasks
                .start(&self.name, config, crate::HashMap::new(), -1.0);
        json!({ "tid": tid })
    }

    fn execute(&self, args: Value) -> Result<Reply, TapError> {
        let args: ExecuteArgs =
            serde_json::from_value(args).map_err(|e| {
                TapError::new(
                    ErrorKind::InvalidRequest,
                    format!("Malformed execute arguments: {}.", e),
                )
            })?;
        let config = {
            let manifest = self.manifest.read();
            manifest.functions.get(&args.function).cloned().ok_or_else(
                || {
                    TapError::new(
                        ErrorKind::InvalidRequest,
                        format!(
                            "Function \"{}\" is unknown.",
                            args.function
                        ),
                    )
                },
            )?
        };
        let tid = self.tasks.start(
            &self.name,
            config,
            args.parameters,
            args.timeout,
        );
        Ok(json!({ "tid": tid }))
    }

    fn fetch(&self, args: &Value) -> Result<Reply, TapError> {
        let tid = Tid::from(required_str(args, "tid")?);
        self.tasks.fetch(&tid).map_err(|e| {
            TapError::new(
                e.kind(),
                format!("\"{}\", {}", self.name, e.message()),
            )
        })
    }

    /// Slave side of `sync_code`: acknowledge, then run one receive
    /// session per selected glob. The final `{res:true}` travels back as
    /// the regular reply of the request loop.
    async fn recv_codebase(
        &self,
        conn: &mut Connection,
        args: &Value,
    ) -> Result<Reply, TapError> {
        let basename = required_str(args, "basename")?;
        let globs = self.codebase_globs(basename)?;
        conn.send(&json!({"res": true})).await.map_err(|e| {
            TapError::new(ErrorKind::Unknown, format!("{:#}", e))
        })?;
        for glob in &globs {
            rw::recv_files(conn, &self.root, glob).await.map_err(|e| {
                TapError::new(ErrorKind::Unknown, format!("{:#}", e))
            })?;
        }
        Ok(json!({"res": true}))
    }

    /// Selects the globs a `sync_code` basename refers to.
    pub fn codebase_globs(
        &self,
        basename: &str,
    ) -> Result<Vec<String>, TapError> {
        self.manifest.read().codebase_globs(basename).ok_or_else(|| {
            TapError::new(ErrorKind::CodebaseNonExist, basename.to_string())
        })
    }
}

fn required_str<'a>(
    args: &'a Value,
    key: &str,
) -> Result<&'a str, TapError> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| {
        TapError::new(
            ErrorKind::InvalidRequest,
            format!("Missing \"{}\" argument.", key),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> Manifest {
        serde_json::from_value(json!({
            "name": "test",
            "codebase": {"core": ["src/*.py"]},
            "functions": {
                "f": {
                    "description": "echo something",
                    "parameters": {"p": "world"},
                    "commands": ["echo $p"],
                    "outputs": {
                        "o": {"cmd": "echo $output_0", "format": ".*"}
                    }
                }
            },
            "warmup": ["echo warm"]
        }))
        .unwrap()
    }

    fn node() -> Node {
        Node::new(
            "test".to_string(),
            manifest(),
            "./manifest.json",
            "test".to_string(),
        )
    }

    #[tokio::test]
    async fn describe_lists_function_descriptions() {
        let node = node();
        let reply = node
            .handle_client(RequestKind::Describe, json!({}), None)
            .await
            .unwrap();
        assert_eq!(reply, json!({"f": "echo something"}));
    }

    #[tokio::test]
    async fn info_returns_the_manifest_function() {
        let node = node();
        let reply = node
            .handle_client(RequestKind::Info, json!({"function": "f"}), None)
            .await
            .unwrap();
        let expected =
            serde_json::to_value(&manifest().functions["f"]).unwrap();
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn info_unknown_function_is_invalid_request() {
        let node = node();
        let err = node
            .handle_client(
                RequestKind::Info,
                json!({"function": "nope"}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn execute_then_fetch_round_trip() {
        let node = node();
        let reply = node
            .handle_client(
                RequestKind::Execute,
                json!({
                    "function": "f",
                    "parameters": {"p": "test"},
                    "timeout": -1.0
                }),
                None,
            )
            .await
            .unwrap();
        let tid = reply["tid"].as_str().unwrap().to_string();

        // poll until the worker stores results
        for _ in 0..500 {
            match node
                .handle_client(
                    RequestKind::Fetch,
                    json!({ "tid": tid }),
                    None,
                )
                .await
            {
                Ok(results) => {
                    assert_eq!(results, json!({"o": "test"}));
                    return;
                }
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::NoResponse);
                    tokio::time::sleep(
                        tokio::time::Duration::from_millis(10),
                    )
                    .await;
                }
            }
        }
        panic!("task never completed");
    }

    #[tokio::test]
    async fn execute_unknown_function_is_invalid_request() {
        let node = node();
        let err = node
            .handle_client(
                RequestKind::Execute,
                json!({"function": "nope"}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn warmup_starts_a_task() {
        let node = node();
        let reply = node
            .handle_client(RequestKind::Warmup, json!({}), None)
            .await
            .unwrap();
        assert!(reply["tid"].as_str().unwrap().len() == 8);
    }

    #[tokio::test]
    async fn sync_code_without_stream_is_invalid() {
        let node = node();
        let err = node
            .handle_client(
                RequestKind::SyncCode,
                json!({"basename": "core"}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn codebase_globs_resolution() {
        let node = node();
        assert_eq!(node.codebase_globs("core").unwrap(), vec!["src/*.py"]);
        assert_eq!(node.codebase_globs("*").unwrap(), vec!["src/*.py"]);
        let err = node.codebase_globs("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodebaseNonExist);
    }
}
