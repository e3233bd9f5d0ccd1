use crate::error::{envelope, ErrorKind, TapError};
use crate::id::Tid;
use crate::manifest::FunctionConfig;
use crate::request::Reply;
use crate::{warn, HashMap};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Wall clock granted to a function when the caller passes a negative
/// timeout.
const DEFAULT_TIMEOUT_SECS: f64 = 999.0;

/// Interval between sub-process liveness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Completed tasks are evicted FIFO once this many have accumulated;
/// running tasks are never evicted.
const MAX_FINISHED_TASKS: usize = 1024;

struct TaskEntry {
    // kept so the worker is not detached-and-forgotten; never awaited,
    // `fetch` only reads `results`
    #[allow(dead_code)]
    handle: Option<JoinHandle<()>>,
    results: Option<Reply>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<Tid, TaskEntry>,
    finished: VecDeque<Tid>,
}

/// A node-local mapping from task id to task state. Written by the worker
/// on completion, read by `fetch`; shared between the dispatcher and any
/// number of in-flight workers.
#[derive(Clone, Default)]
pub struct TaskPool {
    inner: Arc<Mutex<Inner>>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh task and returns its id, re-rolling on the
    /// (unlikely) collision with a live entry.
    fn register(&self) -> Tid {
        let mut inner = self.inner.lock();
        let mut tid = Tid::random();
        while inner.tasks.contains_key(&tid) {
            tid = Tid::random();
        }
        inner.tasks.insert(
            tid.clone(),
            TaskEntry {
                handle: None,
                results: None,
            },
        );
        tid
    }

    fn attach(&self, tid: &Tid, handle: JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().tasks.get_mut(tid) {
            entry.handle = Some(handle);
        }
    }

    /// Stores the task's results; called exactly once per task by its
    /// worker. Evicts the oldest finished tasks past the pool bound.
    fn complete(&self, tid: &Tid, results: Reply) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.tasks.get_mut(tid) {
            entry.results = Some(results);
            inner.finished.push_back(tid.clone());
        }
        while inner.finished.len() > MAX_FINISHED_TASKS {
            if let Some(evicted) = inner.finished.pop_front() {
                inner.tasks.remove(&evicted);
            }
        }
    }

    /// Returns the completed task's results; a task that has not finished
    /// (or was never started here) is a no-response error.
    pub fn fetch(&self, tid: &Tid) -> Result<Reply, TapError> {
        let inner = self.inner.lock();
        inner
            .tasks
            .get(tid)
            .and_then(|entry| entry.results.clone())
            .ok_or_else(|| {
                TapError::new(
                    ErrorKind::NoResponse,
                    format!("tid={}.", tid),
                )
            })
    }

    /// Starts one asynchronous execution of `config` and returns its id
    /// immediately; outcomes only ever surface through `fetch`.
    pub fn start(
        &self,
        node_name: &str,
        config: FunctionConfig,
        params: HashMap<String, Value>,
        timeout: f64,
    ) -> Tid {
        let tid = self.register();
        let pool = self.clone();
        let name = node_name.to_string();
        let worker_tid = tid.clone();
        let handle = tokio::spawn(async move {
            let results =
                match run_function(&name, config, params, timeout).await {
                    Ok(results) => results,
                    Err(e) => envelope("Client", &e),
                };
            pool.complete(&worker_tid, results);
        });
        self.attach(&tid, handle);
        tid
    }
}

/// Runs one manifest function to completion: spawns every command
/// concurrently, polls until all exit or the wall clock runs out, then
/// computes the declared outputs from the captured stdouts.
async fn run_function(
    name: &str,
    config: FunctionConfig,
    params: HashMap<String, Value>,
    timeout: f64,
) -> Result<Reply, TapError> {
    let timeout = if timeout >= 0.0 {
        timeout
    } else {
        DEFAULT_TIMEOUT_SECS
    };

    // caller parameters win over manifest defaults
    let mut exec_params: HashMap<String, String> = config
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
        .collect();
    exec_params
        .extend(params.iter().map(|(k, v)| (k.clone(), scalar_to_string(v))));

    let commands: Vec<String> = config
        .commands
        .iter()
        .map(|cmd| substitute(cmd, &exec_params))
        .collect();

    let mut children = Vec::with_capacity(commands.len());
    for (index, cmd) in commands.iter().enumerate() {
        let child = shell_spawn(cmd).map_err(|e| {
            TapError::new(
                ErrorKind::StdErr,
                format!("{}, [{}]-th command: {}", name, index, e),
            )
        })?;
        children.push(child);
    }

    let exits = poll_until_exit(&mut children, timeout).await;

    // first error wins, stable by command index
    let mut first_err = None;
    for (index, exit) in exits.iter().enumerate() {
        match exit {
            None => {
                let _ = children[index].kill().await;
                if first_err.is_none() {
                    first_err = Some(TapError::new(
                        ErrorKind::Timeout,
                        format!("{}, [{}]-th command.", name, index),
                    ));
                }
            }
            Some(status) if !status.success() => {
                let stderr = read_pipe(children[index].stderr.take()).await;
                if first_err.is_none() {
                    first_err = Some(TapError::new(ErrorKind::StdErr, stderr));
                }
            }
            Some(_) => (),
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    // $output_i carries the repr() of command i's trimmed stdout, so the
    // value survives inlining into a new shell command
    let mut outputs = exec_params.clone();
    for (index, child) in children.iter_mut().enumerate() {
        let stdout = read_pipe(child.stdout.take()).await;
        outputs.insert(format!("output_{}", index), py_repr(stdout.trim()));
    }

    let mut results = serde_json::Map::new();
    for (key, output) in &config.outputs {
        let cmd = substitute(&output.cmd, &outputs);
        let value = extract(&cmd, &output.format).await?;
        results.insert(key.clone(), value);
    }
    Ok(Value::Object(results))
}

/// Polls every child at 1 ms intervals until all have exited or the
/// wall-clock budget is spent; returns each child's exit status, `None`
/// for the ones still running.
async fn poll_until_exit(
    children: &mut [Child],
    timeout: f64,
) -> Vec<Option<std::process::ExitStatus>> {
    let start = Instant::now();
    let mut exits = vec![None; children.len()];
    loop {
        for (index, child) in children.iter_mut().enumerate() {
            if exits[index].is_none() {
                if let Ok(Some(status)) = child.try_wait() {
                    exits[index] = Some(status);
                }
            }
        }
        if exits.iter().all(Option::is_some)
            || start.elapsed().as_secs_f64() > timeout
        {
            return exits;
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

/// Runs one output extractor: execute `cmd` synchronously through the
/// shell, then gather every non-empty `format` match from its stdout.
/// Zero matches flatten to `""`, one match to a plain string.
async fn extract(cmd: &str, format: &str) -> Result<Value, TapError> {
    let output = shell_output(cmd).await.map_err(|e| {
        TapError::new(ErrorKind::StdErr, format!("{}: {}", cmd, e))
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(TapError::new(ErrorKind::StdErr, stderr));
    }
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    let format = Regex::new(format).map_err(|e| {
        TapError::new(
            ErrorKind::Unknown,
            format!("bad output format {:?}: {}", format, e),
        )
    })?;
    let matches: Vec<&str> = format
        .find_iter(&stdout)
        .map(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .collect();
    let value = match matches.as_slice() {
        [] => Value::String(String::new()),
        [only] => Value::String((*only).to_string()),
        many => Value::Array(
            many.iter().map(|m| Value::String((*m).to_string())).collect(),
        ),
    };
    Ok(value)
}

/// Spawns `cmd` as an independent shell sub-process with piped
/// stdout/stderr.
fn shell_spawn(cmd: &str) -> std::io::Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Runs `cmd` through the shell and waits for its full output.
pub async fn shell_output(
    cmd: &str,
) -> std::io::Result<std::process::Output> {
    Command::new("sh").arg("-c").arg(cmd).output().await
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            warn!("[executor] error draining child pipe: {:?}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Single-pass literal substitution of `$key` references: each maximal
/// `$identifier` token is replaced by its value if the map knows the key
/// and kept verbatim otherwise. Values are never re-scanned, so nested
/// `$` references do not expand.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    // the token regex never fails to compile; longest-identifier matching
    // keeps `$p2` from being eaten by a `p` key
    let token = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    token
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Stringifies a scalar parameter value the way it reads in the manifest:
/// strings bare, everything else in its JSON spelling.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Python-style `repr()` of a string: quoted, preferring single quotes,
/// with backslashes, quotes and control characters escaped. Inlining the
/// result into a shell command hands the original value through unharmed.
pub fn py_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use serde_json::json;

    fn config(value: Value) -> FunctionConfig {
        serde_json::from_value(value).unwrap()
    }

    fn params(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    async fn fetch_when_done(pool: &TaskPool, tid: &Tid) -> Reply {
        for _ in 0..500 {
            if let Ok(results) = pool.fetch(tid) {
                return results;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never completed", tid);
    }

    #[test]
    fn py_repr_quoting() {
        assert_eq!(py_repr("hello"), "'hello'");
        assert_eq!(py_repr("it's"), "\"it's\"");
        assert_eq!(py_repr("a\"b'c"), "'a\"b\\'c'");
        assert_eq!(py_repr("a\\b"), "'a\\\\b'");
        assert_eq!(py_repr("a\nb\tc"), "'a\\nb\\tc'");
        assert_eq!(py_repr(""), "''");
    }

    #[test]
    fn substitution_is_single_pass_and_literal() {
        let vars: HashMap<String, String> = vec![
            ("p".to_string(), "$q".to_string()),
            ("q".to_string(), "unreachable".to_string()),
            ("p2".to_string(), "two".to_string()),
        ]
        .into_iter()
        .collect();
        // values are not re-scanned
        assert_eq!(substitute("echo $p", &vars), "echo $q");
        // longest identifier wins
        assert_eq!(substitute("echo $p2", &vars), "echo two");
        // unknown keys stay verbatim
        assert_eq!(substitute("echo $unknown", &vars), "echo $unknown");
    }

    #[test]
    fn scalar_spelling() {
        assert_eq!(scalar_to_string(&json!("text")), "text");
        assert_eq!(scalar_to_string(&json!(3)), "3");
        assert_eq!(scalar_to_string(&json!(3.3)), "3.3");
        assert_eq!(scalar_to_string(&json!(true)), "true");
    }

    #[tokio::test]
    async fn trivial_echo() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["echo hello"],
                "outputs": {"o": {"cmd": "echo $output_0", "format": ".*"}}
            })),
            HashMap::new(),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        // the shell consumes the repr quotes on the way back in
        assert_eq!(results, json!({"o": "hello"}));
    }

    #[tokio::test]
    async fn parameter_propagation() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "parameters": {"p": "world"},
                "commands": ["echo $p"],
                "outputs": {"o": {"cmd": "echo $output_0", "format": ".*"}}
            })),
            params(json!({"p": "test"})),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        assert_eq!(results, json!({"o": "test"}));
    }

    #[tokio::test]
    async fn indexed_output() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["echo 1", "echo 2", "echo 3"],
                "outputs": {"o3": {"cmd": "echo $output_2", "format": ".*"}}
            })),
            HashMap::new(),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        assert_eq!(results, json!({"o3": "3"}));
    }

    #[tokio::test]
    async fn no_commands_outputs_from_parameters() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "parameters": {"param": "no_commands"},
                "outputs": {"o": {"cmd": "echo $param", "format": ".*"}}
            })),
            HashMap::new(),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        assert_eq!(results, json!({"o": "no_commands"}));
    }

    #[tokio::test]
    async fn no_commands_no_outputs_completes_empty() {
        let pool = TaskPool::new();
        let tid =
            pool.start("test", config(json!({})), HashMap::new(), -1.0);
        let results = fetch_when_done(&pool, &tid).await;
        assert_eq!(results, json!({}));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["echo oops >&2; exit 3"]
            })),
            HashMap::new(),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        let err = error::from_reply(&results).unwrap();
        assert_eq!(err.kind(), ErrorKind::StdErr);
        assert!(err.message().contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_and_tags_command_index() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["echo fast", "sleep 30"]
            })),
            HashMap::new(),
            0.2,
        );
        let results = fetch_when_done(&pool, &tid).await;
        let err = error::from_reply(&results).unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.message().contains("[1]-th command"));
    }

    #[tokio::test]
    async fn multi_match_format_collects_list() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["printf 'a1 b2 c3'"],
                "outputs": {
                    "digits": {"cmd": "echo $output_0", "format": r"\d"}
                }
            })),
            HashMap::new(),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        assert_eq!(results, json!({"digits": ["1", "2", "3"]}));
    }

    #[tokio::test]
    async fn no_match_flattens_to_empty_string() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["echo letters"],
                "outputs": {
                    "digits": {"cmd": "echo $output_0", "format": r"\d+"}
                }
            })),
            HashMap::new(),
            -1.0,
        );
        let results = fetch_when_done(&pool, &tid).await;
        assert_eq!(results, json!({"digits": ""}));
    }

    #[tokio::test]
    async fn fetch_unknown_tid_is_no_response() {
        let pool = TaskPool::new();
        let err = pool.fetch(&Tid::from("AAAAAAAA")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoResponse);
    }

    #[tokio::test]
    async fn fetch_running_task_is_no_response() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({"commands": ["sleep 5"]})),
            HashMap::new(),
            10.0,
        );
        let err = pool.fetch(&tid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoResponse);
    }

    #[tokio::test]
    async fn repeated_fetch_is_stable() {
        let pool = TaskPool::new();
        let tid = pool.start(
            "test",
            config(json!({
                "commands": ["echo once"],
                "outputs": {"o": {"cmd": "echo $output_0", "format": ".*"}}
            })),
            HashMap::new(),
            -1.0,
        );
        let first = fetch_when_done(&pool, &tid).await;
        let second = pool.fetch(&tid).unwrap();
        assert_eq!(first, second);
    }
}
