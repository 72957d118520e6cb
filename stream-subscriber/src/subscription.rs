//! The subscription state machine.
//!
//! A [`Subscription`] owns one server-side streaming subscription. Intents
//! (subscribe, unsubscribe, modify, reset) are performed immediately when
//! the subscription is settled, or queued while a control request is in
//! flight. Control requests run as spawned tasks that re-enter the state
//! machine through a weak reference when they complete; a completion whose
//! reference id no longer matches is discarded.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::{Action, QueuedItem};
use crate::parser::Parser;
use crate::protocol::{
    self, ErrorResponse, SubscribeFailure, SubscribeRequest, SubscribeResponse,
};
use crate::queue::ActionQueue;
use crate::scheduler::Runtime;
use crate::state::SubscriptionState;
use crate::transport::{RequestOptions, Response, TransportError};
use crate::types::{
    Error, Event, FORMAT_JSON, ModifyOptions, Payload, Result, StreamingMessage,
    StreamingOutcome, SubscriptionConfig, SubscriptionData, TimingConfig, UpdateKind,
};

type TransportResult = std::result::Result<Response, TransportError>;

/// Handle to one streaming subscription.
///
/// Call the `on_*` intent methods to drive it and [`next`](Subscription::next)
/// to receive [`Event`]s. Dropping the handle abandons in-flight completions.
pub struct Subscription {
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn new(config: SubscriptionConfig, runtime: &Runtime) -> Self {
        let SubscriptionConfig {
            service_path,
            url,
            streaming_context_id,
            mut data,
            timing,
        } = config;
        data.normalize();

        let parser = runtime
            .parsers
            .get_parser(data.format.as_deref(), &service_path, &url);
        if data.format.is_some() {
            data.format = Some(parser.format().to_string());
        }

        let timing = timing.unwrap_or_default();
        let (tx, events) = mpsc::channel(timing.event_channel_capacity.max(1));
        let now = runtime.scheduler.now();
        let inner = Arc::new_cyclic(|this| {
            Mutex::new(Inner {
                this: this.clone(),
                runtime: runtime.clone(),
                events: tx,
                service_path,
                url,
                streaming_context_id,
                reference_id: None,
                data,
                parser,
                schema_name: None,
                queue: ActionQueue::new(),
                state: SubscriptionState::UNSUBSCRIBED,
                timing,
                latest_activity: now,
                inactivity_timeout: 0,
                buffered: Vec::new(),
                reset_history: VecDeque::new(),
                reset_timer: None,
                reset_reference_id: None,
                reset_server_initiated: false,
                retry_timer: None,
                timer_seq: 0,
                dropped_events: 0,
                connection_available: true,
                disposed: false,
            })
        });

        Self { inner, events }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.disposed {
            return Err(Error::Disposed);
        }
        Ok(inner)
    }

    /// Receive the next event. Returns `None` once the subscription and all
    /// its pending tasks are gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Receive an already-emitted event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    pub fn on_subscribe(&self) -> Result<()> {
        let mut inner = self.live()?;
        inner.cancel_network_retry();
        inner.submit(QueuedItem::Subscribe { replace: false });
        Ok(())
    }

    /// Unsubscribe. `force` marks the server-side subscription as already
    /// dead locally, which also drops queued patches and pending deltas.
    pub fn on_unsubscribe(&self, force: bool) -> Result<()> {
        let mut inner = self.live()?;
        inner.cancel_network_retry();
        inner.submit(QueuedItem::Unsubscribe { force });
        Ok(())
    }

    /// Change the subscription arguments.
    pub fn on_modify(&self, arguments: serde_json::Value, options: ModifyOptions) -> Result<()> {
        let mut inner = self.live()?;
        let retry_pending = inner.cancel_network_retry();
        inner.data.arguments = arguments;

        if retry_pending {
            inner.submit(QueuedItem::Subscribe { replace: false });
        } else if inner.state == SubscriptionState::UNSUBSCRIBED && inner.queue.is_empty() {
            tracing::debug!(
                reference_id = ?inner.reference_id,
                "Not subscribed, storing new arguments"
            );
        } else if options.is_patch {
            inner.submit(QueuedItem::ModifyPatch {
                delta: options.patch_delta,
            });
        } else if options.is_replace {
            inner.submit(QueuedItem::ModifyReplace);
        } else {
            inner.submit(QueuedItem::Unsubscribe { force: true });
            inner.submit(QueuedItem::Subscribe { replace: false });
        }
        Ok(())
    }

    /// Hand the subscription over to an external bulk unsubscribe by tag.
    pub fn on_unsubscribe_by_tag_pending(&self) -> Result<()> {
        let mut inner = self.live()?;
        inner.cancel_network_retry();
        inner.submit(QueuedItem::UnsubscribeByTagPending);
        Ok(())
    }

    /// The external bulk unsubscribe by tag has finished.
    pub fn on_unsubscribe_by_tag_complete(&self) -> Result<()> {
        let mut inner = self.live()?;
        if inner.state != SubscriptionState::READY_FOR_UNSUBSCRIBE_BY_TAG {
            tracing::warn!(
                state = %inner.state,
                "Unsubscribe by tag completed in unexpected state"
            );
            return Ok(());
        }
        inner.state = SubscriptionState::UNSUBSCRIBED;
        inner.ready_for_next_action();
        Ok(())
    }

    /// Dispose once every earlier intent has completed and emit
    /// [`Event::ReadyToRemove`].
    pub fn on_remove(&self) -> Result<()> {
        let mut inner = self.live()?;
        inner.cancel_network_retry();
        inner.submit(QueuedItem::Remove);
        Ok(())
    }

    /// Tear down and re-create the server-side subscription. A burst of
    /// resets is taken as a publisher outage and suppressed until it recovers.
    pub fn reset(&self, is_server_initiated: bool) -> Result<()> {
        let mut inner = self.live()?;
        inner.reset(is_server_initiated);
        Ok(())
    }

    /// Stop all activity immediately. Further intents fail with
    /// [`Error::Disposed`].
    pub fn dispose(&self) {
        self.lock().dispose();
    }

    // -----------------------------------------------------------------------
    // Push channel and connection
    // -----------------------------------------------------------------------

    pub fn on_streaming_data(&self, message: StreamingMessage) -> StreamingOutcome {
        self.lock().on_streaming_data(message)
    }

    pub fn on_heartbeat(&self) {
        self.lock().on_activity();
    }

    pub fn on_activity(&self) {
        self.lock().on_activity();
    }

    /// Queue intents until the connection comes back.
    pub fn on_connection_unavailable(&self) {
        self.lock().connection_available = false;
    }

    pub fn on_connection_available(&self) {
        let mut inner = self.lock();
        inner.connection_available = true;
        inner.process_queue();
    }

    /// Used by the next (re)subscribe.
    pub fn set_streaming_context_id(&self, streaming_context_id: impl Into<String>) {
        self.lock().streaming_context_id = streaming_context_id.into();
    }

    /// Milliseconds until the subscription counts as orphaned, negative once
    /// overdue. `None` if it cannot currently be orphaned.
    pub fn time_till_orphaned(&self, now: Instant) -> Option<i64> {
        self.lock().time_till_orphaned(now)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SubscriptionState {
        self.lock().state
    }

    pub fn reference_id(&self) -> Option<String> {
        self.lock().reference_id.clone()
    }

    pub fn streaming_context_id(&self) -> String {
        self.lock().streaming_context_id.clone()
    }

    /// Wire format currently negotiated.
    pub fn format(&self) -> String {
        self.lock().parser.format().to_string()
    }

    pub fn data(&self) -> SubscriptionData {
        self.lock().data.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Inner {
    this: Weak<Mutex<Inner>>,
    runtime: Runtime,
    events: mpsc::Sender<Event>,
    dropped_events: u64,

    service_path: String,
    url: String,
    streaming_context_id: String,
    reference_id: Option<String>,
    data: SubscriptionData,
    parser: Arc<dyn Parser>,
    schema_name: Option<String>,

    queue: ActionQueue,
    state: SubscriptionState,
    timing: TimingConfig,

    latest_activity: Instant,
    /// Seconds; 0 means the subscription never orphans.
    inactivity_timeout: u64,
    /// Deltas received before the snapshot.
    buffered: Vec<StreamingMessage>,

    reset_history: VecDeque<Instant>,
    reset_timer: Option<(u64, CancellationToken)>,
    reset_reference_id: Option<String>,
    /// Kind of the latest reset held back by the suppression timer.
    reset_server_initiated: bool,
    retry_timer: Option<(u64, CancellationToken)>,
    timer_seq: u64,

    connection_available: bool,
    disposed: bool,
}

/// Run `f` against the subscription if it still exists.
fn with_inner(this: &Weak<Mutex<Inner>>, f: impl FnOnce(&mut Inner)) {
    if let Some(inner) = this.upgrade() {
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner);
    }
}

impl Inner {
    fn emit(&mut self, event: Event) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_events += 1;
                tracing::warn!(
                    reference_id = ?self.reference_id,
                    total_dropped = self.dropped_events,
                    "Event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Perform `item` now, or queue it while a request is in flight or the
    /// connection is down.
    fn submit(&mut self, item: QueuedItem) {
        let settled = !self.state.is_transitioning() && self.connection_available;
        if settled && self.queue.is_empty() {
            self.perform(item);
        } else {
            tracing::debug!(
                action = %item.action(),
                state = %self.state,
                reference_id = ?self.reference_id,
                "Queueing action"
            );
            self.queue.enqueue(item);
        }
        self.process_queue();
    }

    fn process_queue(&mut self) {
        while !self.disposed && self.connection_available && !self.state.is_transitioning() {
            let Some(item) = self.queue.dequeue() else {
                break;
            };
            self.perform(item);
        }
    }

    /// Called once a request completes and the state has settled.
    fn ready_for_next_action(&mut self) {
        if self.disposed {
            return;
        }
        if self.queue.is_empty() {
            if !self.state.is_transitioning() {
                self.emit(Event::QueueEmpty);
            }
            return;
        }
        self.process_queue();
    }

    fn perform(&mut self, item: QueuedItem) {
        let action = item.action();
        let state = self.state;
        match item {
            QueuedItem::Subscribe { replace } if state == SubscriptionState::UNSUBSCRIBED => {
                self.queue.clear_modifys();
                self.subscribe(replace);
            }
            QueuedItem::Subscribe { .. } if state == SubscriptionState::SUBSCRIBED => {
                tracing::debug!(reference_id = ?self.reference_id, "Already subscribed");
            }
            QueuedItem::ModifyPatch { delta } if state == SubscriptionState::SUBSCRIBED => {
                self.patch(delta);
            }
            QueuedItem::ModifyReplace if state == SubscriptionState::SUBSCRIBED => {
                self.queue.clear_modifys();
                self.subscribe(true);
            }
            QueuedItem::Unsubscribe { .. }
                if state == SubscriptionState::SUBSCRIBED
                    || state == SubscriptionState::REPLACE_REQUESTED =>
            {
                self.unsubscribe();
            }
            QueuedItem::Unsubscribe { .. } if state == SubscriptionState::UNSUBSCRIBED => {
                tracing::debug!(reference_id = ?self.reference_id, "Already unsubscribed");
            }
            QueuedItem::UnsubscribeByTagPending
                if state == SubscriptionState::SUBSCRIBED
                    || state == SubscriptionState::UNSUBSCRIBED =>
            {
                self.state = SubscriptionState::READY_FOR_UNSUBSCRIBE_BY_TAG;
            }
            QueuedItem::Remove => {
                if state == SubscriptionState::SUBSCRIBED {
                    tracing::warn!(
                        reference_id = ?self.reference_id,
                        "Removing a subscription that is still subscribed"
                    );
                }
                self.dispose();
                self.emit(Event::ReadyToRemove);
            }
            _ => {
                tracing::warn!(
                    action = %action,
                    state = %state,
                    reference_id = ?self.reference_id,
                    "Action not valid in current state"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Control requests
    // -----------------------------------------------------------------------

    fn spawn_request(
        &self,
        method: Method,
        url_template: String,
        template_args: BTreeMap<String, String>,
        options: RequestOptions,
        on_complete: impl FnOnce(&mut Inner, TransportResult) + Send + 'static,
    ) {
        let transport = self.runtime.transport.clone();
        let service_path = self.service_path.clone();
        let this = self.this.clone();
        self.runtime.scheduler.spawn(Box::pin(async move {
            let result = match method {
                Method::Post => {
                    transport
                        .post(&service_path, &url_template, &template_args, options)
                        .await
                }
                Method::Delete => {
                    transport
                        .delete(&service_path, &url_template, &template_args, options)
                        .await
                }
                Method::Patch => {
                    transport
                        .patch(&service_path, &url_template, &template_args, options)
                        .await
                }
            };
            with_inner(&this, |inner| on_complete(inner, result));
        }));
    }

    fn subscribe(&mut self, replace: bool) {
        let replaced = if replace {
            self.reference_id.clone()
        } else {
            None
        };
        let reference_id = self.runtime.ids.next();
        self.reference_id = Some(reference_id.clone());
        self.state = if replace {
            SubscriptionState::REPLACE_REQUESTED
        } else {
            SubscriptionState::SUBSCRIBE_REQUESTED
        };
        self.buffered.clear();

        let request = SubscribeRequest::new(
            &self.streaming_context_id,
            &reference_id,
            &self.data,
            self.parser.schema_names(),
            replaced.clone(),
        );
        tracing::debug!(
            reference_id = %reference_id,
            replaced = ?replaced,
            format = ?self.data.format,
            "Subscribing"
        );

        self.spawn_request(
            Method::Post,
            protocol::subscribe_url(&self.url, self.data.top),
            BTreeMap::new(),
            RequestOptions::with_body(serde_json::to_value(&request).unwrap_or_default()),
            move |inner, result| inner.on_subscribe_complete(&reference_id, replaced, result),
        );
    }

    fn unsubscribe(&mut self) {
        let Some(reference_id) = self.reference_id.clone() else {
            self.state = SubscriptionState::UNSUBSCRIBED;
            return;
        };
        self.state = SubscriptionState::UNSUBSCRIBE_REQUESTED;
        tracing::debug!(reference_id = %reference_id, "Unsubscribing");

        self.spawn_request(
            Method::Delete,
            protocol::subscription_url(&self.url),
            protocol::subscription_args(&self.streaming_context_id, &reference_id),
            RequestOptions::default(),
            move |inner, result| inner.on_unsubscribe_complete(&reference_id, result),
        );
    }

    fn patch(&mut self, delta: serde_json::Value) {
        let Some(reference_id) = self.reference_id.clone() else {
            return;
        };
        self.state = SubscriptionState::PATCH_REQUESTED;
        tracing::debug!(reference_id = %reference_id, "Patching subscription");

        self.spawn_request(
            Method::Patch,
            protocol::subscription_url(&self.url),
            protocol::subscription_args(&self.streaming_context_id, &reference_id),
            RequestOptions::with_body(delta),
            move |inner, result| inner.on_patch_complete(&reference_id, result),
        );
    }

    /// Delete a server-side subscription we no longer track.
    fn cleanup(&self, reference_id: String) {
        tracing::debug!(reference_id = %reference_id, "Deleting stale subscription");
        self.spawn_request(
            Method::Delete,
            protocol::subscription_url(&self.url),
            protocol::subscription_args(&self.streaming_context_id, &reference_id),
            RequestOptions::default(),
            move |_, result| {
                if let Err(e) = result {
                    tracing::debug!(reference_id = %reference_id, error = %e, "Cleanup failed");
                }
            },
        );
    }

    fn is_current(&self, reference_id: &str) -> bool {
        !self.disposed && self.reference_id.as_deref() == Some(reference_id)
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    fn on_subscribe_complete(
        &mut self,
        reference_id: &str,
        replaced: Option<String>,
        result: TransportResult,
    ) {
        if !self.is_current(reference_id) || !self.state.is_subscribing() {
            tracing::debug!(reference_id, "Ignoring stale subscribe response");
            return;
        }
        match result {
            Ok(resp) => self.on_subscribe_success(reference_id, resp.response),
            Err(err) => self.on_subscribe_error(reference_id, replaced, err),
        }
    }

    fn on_subscribe_success(&mut self, reference_id: &str, body: serde_json::Value) {
        let response: SubscribeResponse = serde_json::from_value(body).unwrap_or_else(|e| {
            tracing::warn!(reference_id, error = %e, "Malformed subscribe response");
            SubscribeResponse::default()
        });

        self.state = SubscriptionState::SUBSCRIBED;
        self.inactivity_timeout = response.inactivity_timeout;
        if self.inactivity_timeout == 0 {
            tracing::info!(reference_id, "Inactivity timeout is 0, subscription never orphans");
        }
        self.on_activity();
        tracing::debug!(reference_id, "Subscribed");
        self.emit(Event::Created);

        if self.queue.peek_action() != Some(Action::UNSUBSCRIBE) {
            self.deliver_snapshot(response);
        }
        if self.state == SubscriptionState::SUBSCRIBED {
            self.ready_for_next_action();
        }
    }

    fn on_subscribe_error(
        &mut self,
        reference_id: &str,
        replaced: Option<String>,
        err: TransportError,
    ) {
        let failure = SubscribeFailure::classify(err);
        let had_pending_arguments = self.queue.clear_modifys();
        self.state = SubscriptionState::UNSUBSCRIBED;

        if let Some(old) = replaced {
            self.cleanup(old);
        }

        let unsubscribe_next = self.queue.peek_action().is_some_and(Action::is_unsubscribe);
        if !unsubscribe_next {
            match failure {
                SubscribeFailure::DuplicateKey => {
                    tracing::warn!(reference_id, "Subscription key already in use, retrying");
                    self.cleanup(reference_id.to_string());
                    self.subscribe(false);
                }
                SubscribeFailure::UnsupportedFormat if self.parser.format() != FORMAT_JSON => {
                    tracing::warn!(
                        reference_id,
                        format = self.parser.format(),
                        "Format not supported by endpoint, retrying as JSON"
                    );
                    self.fallback_to_json();
                    self.subscribe(false);
                }
                SubscribeFailure::UnsupportedFormat => {
                    self.report_subscribe_error(
                        reference_id,
                        ErrorResponse {
                            status: 400,
                            response: serde_json::json!({
                                "ErrorCode": protocol::error_code::UNSUPPORTED_FORMAT,
                            }),
                        },
                        had_pending_arguments,
                    );
                }
                SubscribeFailure::Network => {
                    tracing::warn!(reference_id, "Network error subscribing, retry scheduled");
                    self.schedule_network_retry();
                    self.emit(Event::NetworkError);
                }
                SubscribeFailure::Server(err) => {
                    self.report_subscribe_error(reference_id, err, had_pending_arguments);
                }
            }
        }

        if !self.state.is_transitioning() {
            self.ready_for_next_action();
        }
    }

    fn report_subscribe_error(
        &mut self,
        reference_id: &str,
        err: ErrorResponse,
        had_pending_arguments: bool,
    ) {
        tracing::warn!(
            reference_id,
            status = err.status,
            error_code = ?err.error_code(),
            "Subscribe failed"
        );
        self.emit(Event::Error(err));
        if had_pending_arguments {
            tracing::debug!(reference_id, "Retrying with pending arguments");
            self.subscribe(false);
        }
    }

    fn on_unsubscribe_complete(&mut self, reference_id: &str, result: TransportResult) {
        if !self.is_current(reference_id)
            || self.state != SubscriptionState::UNSUBSCRIBE_REQUESTED
        {
            tracing::debug!(reference_id, "Ignoring stale unsubscribe response");
            return;
        }
        if let Err(e) = result {
            tracing::warn!(reference_id, error = %e, "Unsubscribe failed");
        }
        self.state = SubscriptionState::UNSUBSCRIBED;
        self.ready_for_next_action();
    }

    fn on_patch_complete(&mut self, reference_id: &str, result: TransportResult) {
        if !self.is_current(reference_id) || self.state != SubscriptionState::PATCH_REQUESTED {
            tracing::debug!(reference_id, "Ignoring stale patch response");
            return;
        }
        self.state = SubscriptionState::SUBSCRIBED;
        match result {
            Ok(_) => tracing::debug!(reference_id, "Patched"),
            Err(TransportError::Status { status, response }) => {
                tracing::warn!(reference_id, status, "Patch failed");
                if !self.queue.peek_action().is_some_and(Action::is_unsubscribe) {
                    self.emit(Event::Error(ErrorResponse { status, response }));
                }
            }
            Err(e) => tracing::warn!(reference_id, error = %e, "Patch failed"),
        }
        self.ready_for_next_action();
    }

    // -----------------------------------------------------------------------
    // Data delivery
    // -----------------------------------------------------------------------

    fn deliver_snapshot(&mut self, response: SubscribeResponse) {
        if let Some(name) = response.schema_name {
            self.schema_name = Some(name);
        }
        if let Some(schema) = response.schema.filter(|s| !s.is_empty()) {
            match self.schema_name.clone() {
                Some(name) => {
                    if let Err(e) = self.parser.add_schema(&schema, &name) {
                        tracing::warn!(schema = %name, error = %e, "Schema rejected");
                        self.fallback_and_reset();
                        return;
                    }
                }
                None => tracing::warn!(
                    reference_id = ?self.reference_id,
                    "Ignoring schema without a name"
                ),
            }
        }

        if self.parser.format() != FORMAT_JSON {
            let known = self
                .schema_name
                .as_ref()
                .is_some_and(|n| self.parser.schema_names().contains(n));
            if !known {
                tracing::warn!(
                    reference_id = ?self.reference_id,
                    schema = ?self.schema_name,
                    "No schema available for binary format"
                );
                self.fallback_and_reset();
                return;
            }
        }

        if let Some(snapshot) = response.snapshot.filter(|s| !s.is_null()) {
            let data = match snapshot {
                serde_json::Value::String(_) if self.parser.format() != FORMAT_JSON => {
                    match self
                        .parser
                        .parse(&Payload::Json(snapshot), self.schema_name.as_deref())
                    {
                        Ok(decoded) => decoded.unwrap_or_default(),
                        Err(e) => {
                            tracing::warn!(error = %e, "Cannot decode snapshot");
                            self.fallback_and_reset();
                            return;
                        }
                    }
                }
                other => other,
            };
            self.emit(Event::Update {
                data,
                kind: UpdateKind::Snapshot,
            });
        }

        for message in std::mem::take(&mut self.buffered) {
            if self.state != SubscriptionState::SUBSCRIBED {
                break;
            }
            if self.reference_id.as_deref() != Some(message.reference_id.as_str()) {
                continue;
            }
            self.deliver_delta(message);
        }
    }

    fn on_streaming_data(&mut self, message: StreamingMessage) -> StreamingOutcome {
        if self.disposed {
            return StreamingOutcome::Dropped;
        }
        self.on_activity();

        let state = self.state;
        if state == SubscriptionState::UNSUBSCRIBED {
            return StreamingOutcome::NotSubscribed;
        }
        if state.is_subscribing() {
            self.buffered.push(message);
            return StreamingOutcome::Buffered;
        }
        if state != SubscriptionState::SUBSCRIBED && state != SubscriptionState::PATCH_REQUESTED {
            return StreamingOutcome::Dropped;
        }
        if self.queue.next_is_forced_unsubscribe() {
            tracing::debug!(reference_id = %message.reference_id, "Dropping delta, unsubscribing");
            return StreamingOutcome::Dropped;
        }
        if self.reference_id.as_deref() != Some(message.reference_id.as_str()) {
            tracing::debug!(
                reference_id = %message.reference_id,
                current = ?self.reference_id,
                "Dropping delta for previous subscription"
            );
            return StreamingOutcome::Dropped;
        }
        self.deliver_delta(message)
    }

    fn deliver_delta(&mut self, message: StreamingMessage) -> StreamingOutcome {
        let schema_name = message
            .schema_name
            .as_deref()
            .or(self.schema_name.as_deref());
        match self.parser.parse(&message.data, schema_name) {
            Ok(decoded) => {
                let data = message.to_update(decoded.unwrap_or_default());
                self.on_activity();
                self.emit(Event::Update {
                    data,
                    kind: UpdateKind::Delta,
                });
                StreamingOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(
                    reference_id = %message.reference_id,
                    error = %e,
                    "Cannot decode delta"
                );
                self.fallback_and_reset();
                StreamingOutcome::Dropped
            }
        }
    }

    fn fallback_to_json(&mut self) {
        self.parser = self.runtime.parsers.json();
        self.data.format = Some(FORMAT_JSON.to_string());
    }

    fn fallback_and_reset(&mut self) {
        self.fallback_to_json();
        self.reset(false);
    }

    // -----------------------------------------------------------------------
    // Reset and timers
    // -----------------------------------------------------------------------

    fn reset(&mut self, is_server_initiated: bool) {
        if self.reset_timer.is_some() {
            self.reset_reference_id = self.reference_id.clone();
            self.reset_server_initiated = is_server_initiated;
            tracing::debug!(reference_id = ?self.reference_id, "Reset suppressed");
            return;
        }

        let now = self.runtime.scheduler.now();
        self.reset_history.push_back(now);
        while self.reset_history.len() > self.timing.reset_burst {
            self.reset_history.pop_front();
        }
        let burst = self.reset_history.len() >= self.timing.reset_burst
            && self
                .reset_history
                .front()
                .is_some_and(|first| now.duration_since(*first) < self.timing.reset_window());
        if burst {
            tracing::warn!(
                reference_id = ?self.reference_id,
                resets = self.reset_history.len(),
                is_server_initiated,
                "Publisher appears to be down, suppressing resets"
            );
            self.reset_reference_id = self.reference_id.clone();
            self.reset_server_initiated = is_server_initiated;
            let delay = self.timing.reset_suppression();
            self.reset_timer = Some(self.schedule(delay, Inner::on_reset_suppression_elapsed));
            return;
        }

        self.reset_now(is_server_initiated);
    }

    fn reset_now(&mut self, is_server_initiated: bool) {
        if !self.state.is_connected() {
            tracing::debug!(state = %self.state, "Nothing to reset");
            return;
        }
        tracing::info!(
            reference_id = ?self.reference_id,
            state = %self.state,
            is_server_initiated,
            "Resetting"
        );
        let resubscribe = self.queue.ends_connected().unwrap_or(true);
        self.submit(QueuedItem::Unsubscribe { force: true });
        if resubscribe {
            self.submit(QueuedItem::Subscribe { replace: false });
        }
    }

    fn on_reset_suppression_elapsed(&mut self, seq: u64) {
        if self.disposed || self.reset_timer.as_ref().map(|(s, _)| *s) != Some(seq) {
            return;
        }
        self.reset_timer = None;
        self.reset_history.clear();
        let remembered = self.reset_reference_id.take();
        if remembered.is_some() && remembered == self.reference_id && self.state.is_connected() {
            self.reset_now(self.reset_server_initiated);
        }
    }

    fn schedule_network_retry(&mut self) {
        self.cancel_network_retry();
        let delay = self.timing.network_retry_delay();
        self.retry_timer = Some(self.schedule(delay, Inner::on_network_retry_elapsed));
    }

    /// Returns `true` if a retry was pending.
    fn cancel_network_retry(&mut self) -> bool {
        match self.retry_timer.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn on_network_retry_elapsed(&mut self, seq: u64) {
        if self.disposed || self.retry_timer.as_ref().map(|(s, _)| *s) != Some(seq) {
            return;
        }
        self.retry_timer = None;
        tracing::debug!("Retrying subscribe after network error");
        self.submit(QueuedItem::Subscribe { replace: false });
    }

    fn schedule(&mut self, delay: Duration, fire: fn(&mut Inner, u64)) -> (u64, CancellationToken) {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let this = self.this.clone();
        let token = self.runtime.scheduler.schedule(
            delay,
            Box::pin(async move { with_inner(&this, |inner| fire(inner, seq)) }),
        );
        (seq, token)
    }

    // -----------------------------------------------------------------------
    // Activity
    // -----------------------------------------------------------------------

    fn on_activity(&mut self) {
        self.latest_activity = self.runtime.scheduler.now();
    }

    fn time_till_orphaned(&self, now: Instant) -> Option<i64> {
        let idle_state = self.state == SubscriptionState::UNSUBSCRIBED
            || self.state == SubscriptionState::UNSUBSCRIBE_REQUESTED
            || self.state.is_subscribing();
        if !self.connection_available || self.inactivity_timeout == 0 || idle_state {
            return None;
        }
        let timeout_ms = i64::try_from(self.inactivity_timeout.saturating_mul(1000)).ok()?;
        let elapsed_ms =
            i64::try_from(now.saturating_duration_since(self.latest_activity).as_millis())
                .unwrap_or(i64::MAX);
        Some(timeout_ms.saturating_sub(elapsed_ms))
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.queue.reset();
        self.buffered.clear();
        self.cancel_network_retry();
        if let Some((_, token)) = self.reset_timer.take() {
            token.cancel();
        }
    }
}

#[derive(Clone, Copy)]
enum Method {
    Post,
    Delete,
    Patch,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
