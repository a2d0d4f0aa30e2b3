//! Deferred values.
//!
//! A [`Deferred`] holds a value that may not exist yet: a resource id, an IP
//! address, a kubeconfig. It starts pending and settles exactly once, either
//! with a value or with a [`CoreError`]. Continuations registered with
//! [`Deferred::subscribe`] fire once, in registration order, with the settled
//! result.
//!
//! Combinators (`map`, `try_map`, `join_all`, `zip`, [`interpolate`]) build new
//! deferred values without blocking. They settle once their inputs settle and
//! fail fast on the first failing input.
//!
//! Every deferred value carries its provenance: the ids of the resources whose
//! outputs it was derived from. Declaring a resource scans its inputs for
//! provenance to compute dependency edges.
//!
//! # Example
//!
//! ```rust
//! use stratus_core::Deferred;
//!
//! let ip: Deferred<String> = Deferred::pending();
//! let host = ip.map(|ip| format!("lab.{}.nip.io", ip));
//!
//! ip.resolve("20.1.2.3".to_string()).unwrap();
//! assert_eq!(host.peek().unwrap().unwrap(), "lab.20.1.2.3.nip.io");
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CoreError, CoreResult};
use crate::resource::ResourceId;

type Continuation<T> = Box<dyn FnOnce(CoreResult<T>) + Send>;

enum Slot<T> {
    Pending(Vec<Continuation<T>>),
    /// Settled, with continuations still being delivered.
    Firing {
        result: CoreResult<T>,
        queue: VecDeque<Continuation<T>>,
    },
    Settled(CoreResult<T>),
}

/// A value that settles exactly once.
pub struct Deferred<T> {
    slot: Arc<Mutex<Slot<T>>>,
    provenance: Arc<BTreeSet<ResourceId>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            provenance: Arc::clone(&self.provenance),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.slot.lock() {
            Slot::Pending(_) => "pending",
            Slot::Firing { result: Ok(_), .. } | Slot::Settled(Ok(_)) => "resolved",
            Slot::Firing { result: Err(_), .. } | Slot::Settled(Err(_)) => "failed",
        };
        f.debug_struct("Deferred")
            .field("state", &state)
            .field("provenance", &self.provenance)
            .finish()
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + 'static,
{
    /// Create a pending value with no provenance.
    pub fn pending() -> Self {
        Self::with_provenance(BTreeSet::new())
    }

    /// Create a value that is already resolved.
    pub fn resolved(value: T) -> Self {
        Self::settled_with(Ok(value))
    }

    /// Create a value that has already failed.
    pub fn failed(error: CoreError) -> Self {
        Self::settled_with(Err(error))
    }

    /// Create a pending value owned by a resource.
    pub(crate) fn owned_by(id: ResourceId) -> Self {
        Self::with_provenance(BTreeSet::from([id]))
    }

    fn with_provenance(provenance: BTreeSet<ResourceId>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Pending(Vec::new()))),
            provenance: Arc::new(provenance),
        }
    }

    fn settled_with(result: CoreResult<T>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Settled(result))),
            provenance: Arc::new(BTreeSet::new()),
        }
    }

    /// Resources whose outputs this value derives from.
    pub fn provenance(&self) -> &BTreeSet<ResourceId> {
        &self.provenance
    }

    /// Settle with a value.
    pub fn resolve(&self, value: T) -> CoreResult<()> {
        self.settle(Ok(value))
    }

    /// Settle with a failure.
    pub fn fail(&self, error: CoreError) -> CoreResult<()> {
        self.settle(Err(error))
    }

    /// Settle with a result, then deliver it to every continuation in
    /// registration order.
    ///
    /// Returns [`CoreError::AlreadySettled`] if the value has settled before.
    pub fn settle(&self, result: CoreResult<T>) -> CoreResult<()> {
        {
            let mut slot = self.slot.lock();
            let waiting = match &mut *slot {
                Slot::Pending(waiting) => std::mem::take(waiting),
                _ => return Err(CoreError::AlreadySettled),
            };
            *slot = Slot::Firing {
                result: result.clone(),
                queue: waiting.into(),
            };
        }

        // The lock is released while a continuation runs so it can subscribe
        // to this value or settle others. Late subscribers queue behind it.
        loop {
            let next = {
                let mut slot = self.slot.lock();
                let Slot::Firing { queue, .. } = &mut *slot else {
                    break;
                };
                match queue.pop_front() {
                    Some(continuation) => continuation,
                    None => {
                        *slot = Slot::Settled(result.clone());
                        break;
                    }
                }
            };
            next(result.clone());
        }
        Ok(())
    }

    /// Register a continuation invoked once with the settled result.
    ///
    /// If the value has already settled the continuation runs immediately.
    pub fn subscribe<F>(&self, continuation: F)
    where
        F: FnOnce(CoreResult<T>) + Send + 'static,
    {
        let settled = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Pending(waiting) => {
                    waiting.push(Box::new(continuation));
                    return;
                }
                Slot::Firing { queue, .. } => {
                    queue.push_back(Box::new(continuation));
                    return;
                }
                Slot::Settled(result) => result.clone(),
            }
        };
        continuation(settled);
    }

    /// The settled result, if any.
    pub fn peek(&self) -> Option<CoreResult<T>> {
        match &*self.slot.lock() {
            Slot::Pending(_) => None,
            Slot::Firing { result, .. } | Slot::Settled(result) => Some(result.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(&*self.slot.lock(), Slot::Pending(_))
    }

    /// Wait for settlement.
    ///
    /// Yields [`CoreError::Cancelled`] if the value is dropped while pending.
    pub async fn wait(&self) -> CoreResult<T> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| CoreError::Cancelled)?
    }

    /// Derive a value by applying `f` once this one resolves.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Derive a value with a fallible function; its error settles the result.
    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> CoreResult<U> + Send + 'static,
    {
        let derived = Deferred::with_provenance((*self.provenance).clone());
        let target = derived.clone();
        self.subscribe(move |result| {
            let _ = target.settle(result.and_then(f));
        });
        derived
    }

    /// Combine with another value into a tuple.
    pub fn zip<U>(&self, other: &Deferred<U>) -> Deferred<(T, U)>
    where
        U: Clone + Send + 'static,
    {
        let provenance = self
            .provenance
            .union(&other.provenance)
            .copied()
            .collect();
        let joined = Deferred::with_provenance(provenance);
        let parts: Arc<Mutex<(Option<T>, Option<U>)>> = Arc::new(Mutex::new((None, None)));

        let (left_parts, left_target) = (Arc::clone(&parts), joined.clone());
        self.subscribe(move |result| match result {
            Ok(value) => {
                let ready = {
                    let mut parts = left_parts.lock();
                    parts.0 = Some(value);
                    take_pair(&mut parts)
                };
                if let Some(pair) = ready {
                    let _ = left_target.resolve(pair);
                }
            }
            Err(e) => {
                let _ = left_target.fail(e);
            }
        });

        let (right_parts, right_target) = (parts, joined.clone());
        other.subscribe(move |result| match result {
            Ok(value) => {
                let ready = {
                    let mut parts = right_parts.lock();
                    parts.1 = Some(value);
                    take_pair(&mut parts)
                };
                if let Some(pair) = ready {
                    let _ = right_target.resolve(pair);
                }
            }
            Err(e) => {
                let _ = right_target.fail(e);
            }
        });

        joined
    }

    /// Combine many values into one vector, in input order.
    ///
    /// Fails as soon as any input fails, without waiting for pending siblings.
    pub fn join_all(inputs: &[Deferred<T>]) -> Deferred<Vec<T>> {
        let provenance = inputs
            .iter()
            .flat_map(|input| input.provenance.iter().copied())
            .collect();
        let joined = Deferred::with_provenance(provenance);
        if inputs.is_empty() {
            let _ = joined.resolve(Vec::new());
            return joined;
        }

        let state = Arc::new(Mutex::new(JoinState {
            values: vec![None; inputs.len()],
            remaining: inputs.len(),
        }));

        for (index, input) in inputs.iter().enumerate() {
            let state = Arc::clone(&state);
            let target = joined.clone();
            input.subscribe(move |result| match result {
                Ok(value) => {
                    let complete = {
                        let mut state = state.lock();
                        state.values[index] = Some(value);
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            Some(state.values.drain(..).flatten().collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = complete {
                        let _ = target.resolve(values);
                    }
                }
                Err(e) => {
                    let _ = target.fail(e);
                }
            });
        }

        joined
    }
}

struct JoinState<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

fn take_pair<T, U>(parts: &mut (Option<T>, Option<U>)) -> Option<(T, U)> {
    if parts.0.is_some() && parts.1.is_some() {
        parts.0.take().zip(parts.1.take())
    } else {
        None
    }
}

/// Build a string from a template whose `{}` placeholders are filled, in
/// order, by the settled arguments.
///
/// String values are inserted without quotes; other JSON values use their
/// compact JSON form. A placeholder count that does not match the argument
/// count settles the result with [`CoreError::Transform`].
pub fn interpolate(template: impl Into<String>, args: &[Deferred<Value>]) -> Deferred<String> {
    let template = template.into();
    Deferred::join_all(args).try_map(move |values| render(&template, &values))
}

fn render(template: &str, values: &[Value]) -> CoreResult<String> {
    let pieces: Vec<&str> = template.split("{}").collect();
    if pieces.len() - 1 != values.len() {
        return Err(CoreError::Transform(format!(
            "template '{}' has {} placeholders but {} values were given",
            template,
            pieces.len() - 1,
            values.len()
        )));
    }

    let mut rendered = String::with_capacity(template.len());
    for (piece, value) in pieces.iter().zip(values) {
        rendered.push_str(piece);
        match value {
            Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
    }
    if let Some(last) = pieces.last() {
        rendered.push_str(last);
    }
    Ok(rendered)
}
