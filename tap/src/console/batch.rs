use super::Connector;
use crate::error;
use crate::id::Tid;
use crate::request::{self, Reply};
use crate::HashMap;
use color_eyre::eyre::{eyre, Report};
use serde_json::{json, Value};
use tokio::time::Duration;

enum PipelineItem {
    /// one `(target, serialized execute frame)` enqueue
    Task(String, String),
    /// a blocking pause, in seconds
    Wait(f64),
    /// drain previously enqueued task ids into outputs
    Fetch,
}

/// Console-side batch pipeline: consecutive enqueues are flushed through a
/// single `batch_execute` (so every target starts before any reply is
/// awaited), `fetch` items drain the collected task ids into outputs, and
/// waits just sleep. `apply` walks the pipeline and returns the outputs in
/// enqueue order.
pub struct BatchExecutor<'a> {
    console: &'a Connector,
    pipeline: Vec<PipelineItem>,
}

impl<'a> BatchExecutor<'a> {
    pub(crate) fn new(console: &'a Connector) -> Self {
        Self {
            console,
            pipeline: Vec::new(),
        }
    }

    /// Enqueues one execution with default parameters and no timeout
    /// bound. The empty client name targets the master.
    pub fn batch(self, client: &str, function: &str) -> Self {
        self.batch_with(client, function, HashMap::new(), -1.0)
    }

    /// Enqueues one execution.
    pub fn batch_with(
        mut self,
        client: &str,
        function: &str,
        parameters: HashMap<String, Value>,
        timeout: f64,
    ) -> Self {
        let frame = json!({
            "request": "execute",
            "args": {
                "function": function,
                "parameters": parameters,
                "timeout": timeout
            }
        });
        self.pipeline.push(PipelineItem::Task(
            client.to_string(),
            frame.to_string(),
        ));
        self
    }

    /// Enqueues a list of `(client, function)` pairs.
    pub fn batch_all<'b>(
        mut self,
        tasks: impl IntoIterator<Item = (&'b str, &'b str)>,
    ) -> Self {
        for (client, function) in tasks {
            self = self.batch(client, function);
        }
        self
    }

    /// Appends a blocking pause of `duration` seconds.
    pub fn wait(mut self, duration: f64) -> Self {
        self.pipeline.push(PipelineItem::Wait(duration));
        self
    }

    /// Appends a fetch of everything enqueued so far.
    pub fn fetch(mut self) -> Self {
        self.pipeline.push(PipelineItem::Fetch);
        self
    }

    /// Applies the pipeline and returns the fetched outputs in enqueue
    /// order; an enqueue that never produced a task id yields `None`. Any
    /// `err` envelope along the way is re-raised here.
    pub async fn apply(self) -> Result<Vec<Option<Reply>>, Report> {
        let Self { console, pipeline } = self;

        let mut pending: Vec<(String, String)> = Vec::new();
        let mut tid_list: Vec<(String, Option<Tid>)> = Vec::new();
        let mut outputs = Vec::new();

        for item in pipeline {
            match item {
                PipelineItem::Task(target, args) => {
                    pending.push((target, args));
                }
                PipelineItem::Fetch => {
                    flush(console, &mut pending, &mut tid_list).await?;
                    for (target, tid) in tid_list.drain(..) {
                        match tid {
                            Some(tid) => {
                                let output = console
                                    .fetch_from(&target, &tid)
                                    .await?;
                                outputs.push(Some(output));
                            }
                            None => outputs.push(None),
                        }
                    }
                }
                PipelineItem::Wait(duration) => {
                    flush(console, &mut pending, &mut tid_list).await?;
                    tokio::time::sleep(Duration::from_secs_f64(duration))
                        .await;
                }
            }
        }
        // trailing enqueues still start, their outputs are never fetched
        flush(console, &mut pending, &mut tid_list).await?;
        Ok(outputs)
    }
}

/// Flushes the pending enqueues through one `batch_execute` request and
/// appends the resulting `(target, tid)` pairs, preserving order.
async fn flush(
    console: &Connector,
    pending: &mut Vec<(String, String)>,
    tid_list: &mut Vec<(String, Option<Tid>)>,
) -> Result<(), Report> {
    if pending.is_empty() {
        return Ok(());
    }
    let line = request::ipc_batch_line(pending);
    let reply = console.round_trip(line.as_bytes()).await?;

    let errs = reply
        .get("err_list")
        .and_then(Value::as_array)
        .ok_or_else(|| eyre!("reply carries no err_list: {}", reply))?;
    for err in errs {
        if !err.is_null() {
            if let Some(e) = error::untangle(err) {
                return Err(Report::new(e));
            }
            return Err(eyre!("undecodable batch error: {}", err));
        }
    }

    let tids = reply
        .get("tid_list")
        .and_then(Value::as_array)
        .ok_or_else(|| eyre!("reply carries no tid_list: {}", reply))?;
    for ((target, _), tid) in pending.drain(..).zip(tids) {
        let tid = tid.as_str().map(Tid::from);
        tid_list.push((target, tid));
    }
    Ok(())
}
