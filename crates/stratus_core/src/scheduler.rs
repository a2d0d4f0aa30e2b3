//! Settlement-driven execution of a stack's resource nodes.
//!
//! The scheduler is a single coordination loop. Every node starts with a
//! count of the deferred values it waits on: each embedded input plus the
//! completion of each ordering dependency. Settlement of any of those values
//! sends an event back to the loop through an unbounded channel, so node
//! state, the counts and the ready queue are only ever touched by the loop.
//!
//! Provider calls run on spawned tasks. When one finishes, the loop settles
//! the node's outputs, whose continuations in turn notify dependents.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::deferred::Deferred;
use crate::error::{CoreError, CoreResult};
use crate::options::RetryPolicy;
use crate::report::NodeReport;
use crate::resource::{ApplyRequest, NodeState, Outputs, Provider, ResourceNode};

/// Requests cancellation of a running stack.
///
/// Nodes that have not started executing are cancelled immediately. Nodes
/// already executing finish, but their results are discarded and they are
/// reported as cancelled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

enum Event {
    /// One awaited input or ordering completion settled.
    InputSettled { node: usize, outcome: CoreResult<()> },
    /// A provider call finished, after any retries.
    Applied {
        node: usize,
        outcome: CoreResult<Outputs>,
        attempts: u32,
    },
}

pub(crate) struct Scheduler<'a> {
    nodes: &'a [ResourceNode],
    config: &'a RunConfig,
    cancel: CancelHandle,
    reports: Vec<NodeReport>,
    waiting: Vec<usize>,
    ready: VecDeque<usize>,
    in_flight: usize,
    cancelled: bool,
}

impl<'a> Scheduler<'a> {
    /// Node ids must equal their index in `nodes`.
    pub(crate) fn new(nodes: &'a [ResourceNode], config: &'a RunConfig, cancel: CancelHandle) -> Self {
        let reports = nodes
            .iter()
            .map(|node| NodeReport::new(&node.name, &node.type_tag))
            .collect();
        Self {
            nodes,
            config,
            cancel,
            reports,
            waiting: vec![0; nodes.len()],
            ready: VecDeque::new(),
            in_flight: 0,
            cancelled: false,
        }
    }

    /// Drive every node to a terminal state.
    ///
    /// Inputs that are not outputs of any node in the stack keep their
    /// dependents waiting until they settle or the run is cancelled.
    pub(crate) async fn run(mut self) -> Vec<NodeReport> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribe_inputs(&tx);

        let limit = match self.config.max_concurrency {
            0 => usize::MAX,
            n => n,
        };
        let mut cancel_rx = self.cancel.subscribe();
        let mut watch_cancel = true;
        if self.cancel.is_cancelled() {
            self.cancel_waiting();
        }

        loop {
            while !self.cancelled && self.in_flight < limit {
                let Some(index) = self.ready.pop_front() else {
                    break;
                };
                self.launch(index, &tx);
            }

            if self.in_flight == 0 && self.reports.iter().all(|r| r.state.is_terminal()) {
                break;
            }

            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                changed = cancel_rx.changed(), if watch_cancel && !self.cancelled => match changed {
                    Ok(()) if *cancel_rx.borrow_and_update() => self.cancel_waiting(),
                    Ok(()) => {}
                    Err(_) => watch_cancel = false,
                },
            }
        }

        self.reports
    }

    fn subscribe_inputs(&mut self, tx: &mpsc::UnboundedSender<Event>) {
        let mut watched: Vec<(Vec<Deferred<Value>>, Vec<Deferred<()>>)> =
            Vec::with_capacity(self.nodes.len());

        for (index, node) in self.nodes.iter().enumerate() {
            let inputs = node.inputs.deferreds();
            let ordering: Vec<Deferred<()>> = node
                .ordering
                .iter()
                .filter_map(|dep| self.nodes.get(dep.index()))
                .map(|dep| dep.completion.clone())
                .collect();

            self.reports[index].state = NodeState::Pending;
            self.waiting[index] = inputs.len() + ordering.len();
            if self.waiting[index] == 0 {
                self.ready.push_back(index);
            }
            watched.push((inputs, ordering));
        }

        // Counts are in place before the first continuation can fire.
        for (index, (inputs, ordering)) in watched.into_iter().enumerate() {
            for input in inputs {
                let tx = tx.clone();
                input.subscribe(move |result| {
                    let _ = tx.send(Event::InputSettled {
                        node: index,
                        outcome: result.map(|_| ()),
                    });
                });
            }
            for completion in ordering {
                let tx = tx.clone();
                completion.subscribe(move |result| {
                    let _ = tx.send(Event::InputSettled {
                        node: index,
                        outcome: result,
                    });
                });
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::InputSettled { node, outcome } => self.on_input(node, outcome),
            Event::Applied {
                node,
                outcome,
                attempts,
            } => self.on_applied(node, outcome, attempts),
        }
    }

    fn on_input(&mut self, index: usize, outcome: CoreResult<()>) {
        if self.reports[index].state != NodeState::Pending {
            return;
        }
        match outcome {
            Ok(()) => {
                self.waiting[index] = self.waiting[index].saturating_sub(1);
                if self.waiting[index] == 0 {
                    debug!("{} is ready", self.nodes[index].name);
                    self.ready.push_back(index);
                }
            }
            Err(CoreError::Cancelled) => self.mark_cancelled(index),
            Err(err) => {
                let nodes = self.nodes;
                let name = &nodes[index].name;
                let upstream = err
                    .resource()
                    .filter(|upstream| *upstream != name.as_str())
                    .map(str::to_string);
                let error = match upstream {
                    Some(dependency) => CoreError::DependencyFailed {
                        resource: name.clone(),
                        dependency,
                        source: Box::new(err),
                    },
                    None => err,
                };
                self.mark_failed(index, error);
            }
        }
    }

    fn launch(&mut self, index: usize, tx: &mpsc::UnboundedSender<Event>) {
        if self.reports[index].state != NodeState::Pending || self.waiting[index] != 0 {
            return;
        }
        let nodes = self.nodes;
        let node = &nodes[index];
        let inputs = match node.inputs.resolve_now() {
            Some(Ok(inputs)) => inputs,
            Some(Err(err)) => return self.mark_failed(index, err),
            None => {
                let err = CoreError::Unresolved(format!("inputs of '{}'", node.name));
                return self.mark_failed(index, err);
            }
        };

        info!("Applying {} '{}'", node.type_tag, node.name);
        let report = &mut self.reports[index];
        report.state = NodeState::Executing;
        report.started_at = Some(Utc::now());
        report.inputs = Some(inputs.clone());

        let provider = Arc::clone(&node.provider);
        let request = ApplyRequest::new(&node.name, &node.type_tag, inputs);
        let timeout = node.options.timeout.or_else(|| self.config.apply_timeout());
        let retry = node
            .options
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry_policy());
        let name = node.name.clone();
        let tx = tx.clone();

        self.in_flight += 1;
        tokio::spawn(async move {
            // The inner task isolates a panicking provider.
            let attempt = tokio::spawn(apply_with_policy(provider, request, timeout, retry));
            let (outcome, attempts) = match attempt.await {
                Ok(done) => done,
                Err(err) => (
                    Err(CoreError::provider(&name, format!("apply task failed: {}", err))),
                    1,
                ),
            };
            let _ = tx.send(Event::Applied {
                node: index,
                outcome,
                attempts,
            });
        });
    }

    fn on_applied(&mut self, index: usize, outcome: CoreResult<Outputs>, attempts: u32) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.reports[index].attempts = attempts;

        if self.cancelled {
            info!("Discarding result of '{}': run cancelled", self.nodes[index].name);
            return self.mark_cancelled(index);
        }

        let nodes = self.nodes;
        let node = &nodes[index];
        match outcome.and_then(|outputs| check_outputs(node, outputs)) {
            Ok(outputs) => {
                let report = &mut self.reports[index];
                report.state = NodeState::Settled;
                report.completed_at = Some(Utc::now());
                report.outputs = Some(outputs.clone());
                info!("{} '{}' settled", node.type_tag, node.name);

                for (field, output) in &node.outputs {
                    if let Some(value) = outputs.get(field) {
                        let _ = output.resolve(value.clone());
                    }
                }
                let _ = node.completion.resolve(());
            }
            Err(err) => self.mark_failed(index, err),
        }
    }

    fn mark_failed(&mut self, index: usize, error: CoreError) {
        let nodes = self.nodes;
        let node = &nodes[index];
        if error.is_dependency_failure() {
            warn!("{} '{}' not applied: {}", node.type_tag, node.name, error);
        } else {
            error!("{} '{}' failed: {}", node.type_tag, node.name, error);
        }
        let report = &mut self.reports[index];
        report.state = NodeState::Failed;
        report.completed_at = Some(Utc::now());
        report.error = Some(error.clone());
        node.fail_outputs(&error);
    }

    fn mark_cancelled(&mut self, index: usize) {
        let report = &mut self.reports[index];
        report.state = NodeState::Cancelled;
        report.completed_at = Some(Utc::now());
        report.error = Some(CoreError::Cancelled);
        self.nodes[index].fail_outputs(&CoreError::Cancelled);
    }

    /// Cancel every node that has not started executing.
    fn cancel_waiting(&mut self) {
        info!("Cancelling run");
        self.cancelled = true;
        self.ready.clear();
        for index in 0..self.nodes.len() {
            if self.reports[index].state == NodeState::Pending {
                self.mark_cancelled(index);
            }
        }
    }
}

/// Every declared output must be present in a successful apply.
fn check_outputs(node: &ResourceNode, outputs: Outputs) -> CoreResult<Outputs> {
    let missing: Vec<&str> = node
        .outputs
        .keys()
        .filter(|field| !outputs.contains_key(field.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(outputs)
    } else {
        Err(CoreError::provider(
            &node.name,
            format!("apply did not return outputs: {}", missing.join(", ")),
        ))
    }
}

/// Invoke `apply` until it succeeds or the retry policy is exhausted.
///
/// Returns the final outcome and the number of calls made.
async fn apply_with_policy(
    provider: Arc<dyn Provider>,
    request: ApplyRequest,
    timeout: Option<Duration>,
    retry: RetryPolicy,
) -> (CoreResult<Outputs>, u32) {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let outcome = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, provider.apply(&request)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout {
                    resource: request.name.clone(),
                    after: deadline,
                }),
            },
            None => provider.apply(&request).await,
        };

        match outcome {
            Err(err) if attempts <= retry.retries => {
                let delay = retry.backoff.delay(attempts);
                warn!(
                    "Apply of '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                    request.name,
                    attempts,
                    retry.retries + 1,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
            }
            outcome => return (outcome, attempts),
        }
    }
}
