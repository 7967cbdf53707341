// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Promise primitive used for the loader's internal sequencing
//!
//! - settle-once: pending -> fulfilled | rejected, never again
//! - resolving with another promise adopts its eventual state
//! - resolving a promise with itself rejects with [`LoaderError::SelfResolution`]
//! - reactions always run from the microtask queue, never synchronously,
//!   and in registration order
//! - [`Promise::all`] keeps input order and fails on the first rejection

use crate::error::{LoaderError, Result};
use crate::runtime::EventLoop;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Fulfillment handler
pub type OnFulfilled = Box<dyn FnOnce(Value) -> Result<Value>>;

/// Rejection handler
pub type OnRejected = Box<dyn FnOnce(LoaderError) -> Result<Value>>;

/// Promise state
#[derive(Debug, Clone)]
pub enum PromiseState {
    /// Initial state, neither fulfilled nor rejected
    Pending,
    /// Operation completed successfully
    Fulfilled(Value),
    /// Operation failed
    Rejected(LoaderError),
}

/// A reaction registered through `then`
struct PromiseReaction {
    on_fulfilled: Option<OnFulfilled>,
    on_rejected: Option<OnRejected>,
    /// Settles the promise returned by `then`
    target: Resolver,
}

struct PromiseInner {
    id: u64,
    state: PromiseState,
    reactions: Vec<PromiseReaction>,
    handled: bool,
}

/// A settle-once thenable scheduled on an [`EventLoop`]
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<PromiseInner>>,
    event_loop: Rc<EventLoop>,
}

thread_local! {
    static PROMISE_ID_COUNTER: Cell<u64> = const { Cell::new(1) };
}

fn next_promise_id() -> u64 {
    PROMISE_ID_COUNTER.with(|counter| {
        let id = counter.get();
        counter.set(id + 1);
        id
    })
}

impl Promise {
    /// Create a promise and run `executor` synchronously with its resolver
    ///
    /// An `Err` returned by the executor rejects the promise.
    pub fn new(
        event_loop: &Rc<EventLoop>,
        executor: impl FnOnce(Resolver) -> Result<()>,
    ) -> Self {
        let (promise, resolver) = Self::with_resolver(event_loop);
        if let Err(err) = executor(resolver.clone()) {
            resolver.reject(err);
        }
        promise
    }

    /// Create a pending promise together with its resolver
    pub fn with_resolver(event_loop: &Rc<EventLoop>) -> (Self, Resolver) {
        let promise = Self {
            inner: Rc::new(RefCell::new(PromiseInner {
                id: next_promise_id(),
                state: PromiseState::Pending,
                reactions: Vec::new(),
                handled: false,
            })),
            event_loop: Rc::clone(event_loop),
        };
        let resolver = Resolver {
            promise: promise.clone(),
            already_resolved: Rc::new(Cell::new(false)),
        };
        (promise, resolver)
    }

    /// Create a promise resolved with `value` (adopting it if thenable)
    pub fn resolved(event_loop: &Rc<EventLoop>, value: Value) -> Self {
        let (promise, resolver) = Self::with_resolver(event_loop);
        resolver.resolve(value);
        promise
    }

    /// Create a rejected promise
    pub fn rejected(event_loop: &Rc<EventLoop>, reason: LoaderError) -> Self {
        let (promise, resolver) = Self::with_resolver(event_loop);
        resolver.reject(reason);
        promise
    }

    /// Unique ID
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> PromiseState {
        self.inner.borrow().state.clone()
    }

    /// Check if promise is pending
    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Pending)
    }

    /// Check if promise is fulfilled
    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Fulfilled(_))
    }

    /// Check if promise is rejected
    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Rejected(_))
    }

    /// Fulfillment value, if fulfilled
    pub fn value(&self) -> Option<Value> {
        match &self.inner.borrow().state {
            PromiseState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Rejection reason, if rejected
    pub fn reason(&self) -> Option<LoaderError> {
        match &self.inner.borrow().state {
            PromiseState::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register handlers; returns a promise settled by their outcome
    ///
    /// A missing handler passes the value or reason through unchanged.
    pub fn then<F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise
    where
        F: FnOnce(Value) -> Result<Value> + 'static,
        R: FnOnce(LoaderError) -> Result<Value> + 'static,
    {
        self.add_reaction(Some(Box::new(on_fulfilled)), Some(Box::new(on_rejected)))
    }

    /// Register a fulfillment handler only
    pub fn map<F>(&self, on_fulfilled: F) -> Promise
    where
        F: FnOnce(Value) -> Result<Value> + 'static,
    {
        self.add_reaction(Some(Box::new(on_fulfilled)), None)
    }

    /// Register a rejection handler only
    pub fn catch<R>(&self, on_rejected: R) -> Promise
    where
        R: FnOnce(LoaderError) -> Result<Value> + 'static,
    {
        self.add_reaction(None, Some(Box::new(on_rejected)))
    }

    fn add_reaction(
        &self,
        on_fulfilled: Option<OnFulfilled>,
        on_rejected: Option<OnRejected>,
    ) -> Promise {
        let (child, target) = Promise::with_resolver(&self.event_loop);
        let reaction = PromiseReaction {
            on_fulfilled,
            on_rejected,
            target,
        };

        let mut inner = self.inner.borrow_mut();
        if reaction.on_rejected.is_some() {
            inner.handled = true;
        }
        let settled = match &inner.state {
            PromiseState::Pending => None,
            outcome => Some(outcome.clone()),
        };
        match settled {
            None => inner.reactions.push(reaction),
            Some(outcome) => {
                // Already settled: still deferred to the microtask queue
                drop(inner);
                self.schedule(reaction, outcome);
            }
        }
        child
    }

    fn schedule(&self, reaction: PromiseReaction, outcome: PromiseState) {
        self.event_loop.queue_microtask(move || {
            let PromiseReaction {
                on_fulfilled,
                on_rejected,
                target,
            } = reaction;
            let result = match outcome {
                PromiseState::Fulfilled(value) => match on_fulfilled {
                    Some(handler) => handler(value),
                    None => Ok(value),
                },
                PromiseState::Rejected(reason) => match on_rejected {
                    Some(handler) => handler(reason),
                    None => Err(reason),
                },
                PromiseState::Pending => return,
            };
            match result {
                Ok(value) => target.resolve(value),
                Err(reason) => target.reject(reason),
            }
        });
    }

    /// Move from pending to a settled state and schedule every reaction
    fn settle(&self, outcome: PromiseState) {
        let reactions = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = outcome.clone();
            if let PromiseState::Rejected(reason) = &outcome {
                if inner.reactions.is_empty() && !inner.handled {
                    tracing::warn!(promise = inner.id, "promise rejected with no handler: {}", reason);
                }
            }
            std::mem::take(&mut inner.reactions)
        };
        for reaction in reactions {
            self.schedule(reaction, outcome.clone());
        }
    }

    /// Wait for every promise; values keep input order
    ///
    /// Rejects with the first rejection; later results are discarded.
    pub fn all(event_loop: &Rc<EventLoop>, promises: impl IntoIterator<Item = Promise>) -> Promise {
        let promises: Vec<Promise> = promises.into_iter().collect();
        let (result, resolver) = Promise::with_resolver(event_loop);

        if promises.is_empty() {
            resolver.resolve(Value::array(Vec::new()));
            return result;
        }

        let slots = Rc::new(RefCell::new(vec![Value::Undefined; promises.len()]));
        let remaining = Rc::new(Cell::new(promises.len()));

        for (index, promise) in promises.into_iter().enumerate() {
            let slots = Rc::clone(&slots);
            let remaining = Rc::clone(&remaining);
            let on_value = resolver.clone();
            let on_reason = resolver.clone();
            promise.then(
                move |value| {
                    slots.borrow_mut()[index] = value;
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values = std::mem::take(&mut *slots.borrow_mut());
                        on_value.resolve(Value::array(values));
                    }
                    Ok(Value::Undefined)
                },
                move |reason| {
                    on_reason.reject(reason);
                    Ok(Value::Undefined)
                },
            );
        }

        result
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Promise")
                .field("id", &inner.id)
                .field("state", &inner.state)
                .finish(),
            Err(_) => write!(f, "Promise(<busy>)"),
        }
    }
}

/// Capability to settle one promise, at most once
#[derive(Clone)]
pub struct Resolver {
    promise: Promise,
    already_resolved: Rc<Cell<bool>>,
}

impl Resolver {
    /// The promise this resolver settles
    pub fn promise(&self) -> &Promise {
        &self.promise
    }

    /// Resolve; a promise value is adopted rather than stored
    pub fn resolve(&self, value: Value) {
        if self.already_resolved.replace(true) {
            return;
        }
        match value {
            Value::Promise(other) if other.ptr_eq(&self.promise) => {
                self.promise
                    .settle(PromiseState::Rejected(LoaderError::SelfResolution));
            }
            Value::Promise(other) => {
                let on_value = self.promise.clone();
                let on_reason = self.promise.clone();
                other.then(
                    move |value| {
                        Resolver::adopting(on_value).resolve(value);
                        Ok(Value::Undefined)
                    },
                    move |reason| {
                        on_reason.settle(PromiseState::Rejected(reason));
                        Ok(Value::Undefined)
                    },
                );
            }
            value => self.promise.settle(PromiseState::Fulfilled(value)),
        }
    }

    /// Fulfill with `value` as-is, without adopting a promise value
    pub fn fulfill(&self, value: Value) {
        if self.already_resolved.replace(true) {
            return;
        }
        self.promise.settle(PromiseState::Fulfilled(value));
    }

    /// Reject with a reason
    pub fn reject(&self, reason: LoaderError) {
        if self.already_resolved.replace(true) {
            return;
        }
        self.promise.settle(PromiseState::Rejected(reason));
    }

    /// Fresh resolver for a promise whose original resolver has committed to
    /// adopting another thenable
    fn adopting(promise: Promise) -> Resolver {
        Resolver {
            promise,
            already_resolved: Rc::new(Cell::new(false)),
        }
    }
}
