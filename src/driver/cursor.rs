//! Lazy stream over the results of one query
//!
//! Results arrive in batches. While the last buffered batch is being consumed
//! the cursor asks for the next one in the background, with at most one
//! CONTINUE outstanding at any time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use docdb_proto::{Query, Response, ResponseNote, ResponseType};
use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use crate::context::Context;
use crate::error::{DriverError, DriverResult};

/// What kind of stream the server opened, taken from the response notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorKind {
    #[default]
    Plain,
    SequenceFeed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
}

impl CursorKind {
    fn from_response(response: &Response) -> Self {
        response
            .notes()
            .find_map(|note| match note {
                ResponseNote::SequenceFeed => Some(CursorKind::SequenceFeed),
                ResponseNote::AtomFeed => Some(CursorKind::AtomFeed),
                ResponseNote::OrderByLimitFeed => Some(CursorKind::OrderByLimitFeed),
                ResponseNote::UnionedFeed => Some(CursorKind::UnionedFeed),
                ResponseNote::IncludesStates => None,
            })
            .unwrap_or_default()
    }

    pub fn is_feed(self) -> bool {
        self != CursorKind::Plain
    }
}

#[derive(Default)]
struct CursorState {
    batches: VecDeque<VecDeque<Value>>,
    finished: bool,
    closed: bool,
    err: Option<DriverError>,
}

impl CursorState {
    fn push_batch(&mut self, docs: Vec<Value>) {
        if !self.closed && !docs.is_empty() {
            self.batches.push_back(docs.into());
        }
    }

    fn set_err(&mut self, err: DriverError) {
        if self.err.is_none() && !self.closed {
            self.err = Some(err);
        }
    }

    fn front(&mut self) -> Option<&Value> {
        while self.batches.front().is_some_and(VecDeque::is_empty) {
            self.batches.pop_front();
        }
        self.batches.front().and_then(VecDeque::front)
    }

    fn pop(&mut self) -> Option<Value> {
        self.front()?;
        let batch = self.batches.front_mut()?;
        let doc = batch.pop_front();
        if batch.is_empty() {
            self.batches.pop_front();
        }
        doc
    }

    fn buffered(&self) -> usize {
        self.batches.iter().map(VecDeque::len).sum()
    }
}

/// The part of a cursor the dispatcher feeds
pub(crate) struct CursorShared {
    token: u64,
    term: Option<Value>,
    state: Mutex<CursorState>,
    notify: Notify,
    fetching: AtomicBool,
}

impl CursorShared {
    fn new(token: u64, term: Option<Value>, state: CursorState) -> Self {
        Self {
            token,
            term,
            state: Mutex::new(state),
            notify: Notify::new(),
            fetching: AtomicBool::new(false),
        }
    }

    /// Append a reply for this cursor's token. Returns true once the stream is over.
    pub(super) fn extend(&self, response: Response) -> bool {
        let terminal = {
            let mut state = self.state.lock();
            let terminal = match response.response_type() {
                Some(ResponseType::SuccessPartial) => {
                    state.push_batch(response.responses);
                    false
                }
                Some(ResponseType::SuccessSequence) | Some(ResponseType::SuccessAtom) => {
                    state.push_batch(response.responses);
                    true
                }
                Some(ResponseType::WaitComplete) => true,
                Some(kind) if kind.is_error() => {
                    state.set_err(DriverError::from_response(&response, self.term.as_ref()));
                    true
                }
                _ => {
                    state.set_err(DriverError::Driver(format!(
                        "unexpected response type: {}",
                        response.type_code
                    )));
                    true
                }
            };
            if terminal {
                state.finished = true;
            }
            terminal
        };

        self.wake();
        terminal
    }

    /// End the stream with `err`
    pub(super) fn fail(&self, err: DriverError) {
        {
            let mut state = self.state.lock();
            state.set_err(err);
            state.finished = true;
        }
        self.wake();
    }

    fn wake(&self) {
        self.fetching.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }
}

enum Pulled {
    Doc { doc: Value, prefetch: bool },
    End,
    Wait,
}

pub struct Cursor {
    ctx: Context,
    conn: Weak<Connection>,
    shared: Arc<CursorShared>,
    opts: Map<String, Value>,
    profile: Option<Value>,
    kind: CursorKind,
    use_json_number: bool,
}

impl Cursor {
    /// Cursor over the first reply to `q`. Documents are moved out of `response`.
    pub(super) fn from_response(
        ctx: Context,
        conn: &Arc<Connection>,
        q: &Query,
        response: &mut Response,
        finished: bool,
    ) -> Self {
        let kind = CursorKind::from_response(response);
        let mut state = CursorState {
            finished,
            ..Default::default()
        };
        state.push_batch(take_documents(response));

        Self {
            ctx,
            conn: Arc::downgrade(conn),
            shared: Arc::new(CursorShared::new(q.token, q.term.clone(), state)),
            opts: q.opts.clone(),
            profile: response.profile.clone(),
            kind,
            use_json_number: conn.opts().use_json_number,
        }
    }

    /// A finished cursor over fixed documents, not tied to any connection
    pub fn from_documents(docs: Vec<Value>) -> Self {
        let mut state = CursorState {
            finished: true,
            ..Default::default()
        };
        state.push_batch(docs);

        Self {
            ctx: Context::background(),
            conn: Weak::new(),
            shared: Arc::new(CursorShared::new(0, None, state)),
            opts: Map::new(),
            profile: None,
            kind: CursorKind::Plain,
            // handed back exactly as given
            use_json_number: true,
        }
    }

    pub(super) fn shared(&self) -> Arc<CursorShared> {
        self.shared.clone()
    }

    pub fn token(&self) -> u64 {
        self.shared.token
    }

    pub fn term(&self) -> Option<&Value> {
        self.shared.term.as_ref()
    }

    pub fn opts(&self) -> &Map<String, Value> {
        &self.opts
    }

    /// Profile returned with the first reply when the query asked for one
    pub fn profile(&self) -> Option<&Value> {
        self.profile.as_ref()
    }

    pub fn kind(&self) -> CursorKind {
        self.kind
    }

    pub fn is_feed(&self) -> bool {
        self.kind.is_feed()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Documents received but not read yet
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffered()
    }

    /// Error that ended the stream, if any
    pub fn err(&self) -> Option<DriverError> {
        self.shared.state.lock().err.clone()
    }

    // ==================== Reading ====================

    /// Next document, or `None` at the end of the stream.
    ///
    /// Errors are recorded and reported by [`Cursor::err`]; use
    /// [`Cursor::try_next`] to receive them directly.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Option<T> {
        match self.try_next().await {
            Ok(doc) => doc,
            Err(e) => {
                self.shared.state.lock().set_err(e);
                None
            }
        }
    }

    pub async fn try_next<T: DeserializeOwned>(&mut self) -> DriverResult<Option<T>> {
        match self.pull(true).await? {
            Some(doc) => self.decode(doc).map(Some),
            None => Ok(None),
        }
    }

    /// The next document without consuming it
    pub async fn peek<T: DeserializeOwned>(&mut self) -> DriverResult<Option<T>> {
        match self.pull(false).await? {
            Some(doc) => self.decode(doc).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the next document without decoding it
    pub async fn skip(&mut self) -> DriverResult<()> {
        self.pull(true).await.map(|_| ())
    }

    /// Whether the stream is empty or its next document is null
    pub async fn is_nil(&mut self) -> DriverResult<bool> {
        Ok(matches!(
            self.pull(false).await?,
            None | Some(Value::Null)
        ))
    }

    /// Drain every remaining document, then close
    pub async fn all<T: DeserializeOwned>(&mut self) -> DriverResult<Vec<T>> {
        let mut docs = Vec::with_capacity(self.buffered());
        let result = loop {
            match self.try_next().await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => break Ok(docs),
                Err(e) => break Err(e),
            }
        };
        self.close().await;
        result
    }

    /// Exactly one document, then close
    pub async fn one<T: DeserializeOwned>(&mut self) -> DriverResult<T> {
        let result = self.try_next().await;
        self.close().await;
        result?.ok_or(DriverError::EmptyResult)
    }

    /// Send every document to `tx` from a background task; the channel closes at the end
    pub fn listen<T>(mut self, tx: mpsc::Sender<T>) -> JoinHandle<DriverResult<()>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        tokio::spawn(async move {
            let result = loop {
                let next = tokio::select! {
                    next = self.try_next::<T>() => next,
                    _ = tx.closed() => break Ok(()),
                };
                match next {
                    Ok(Some(doc)) => {
                        if tx.send(doc).await.is_err() {
                            break Ok(());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            self.close().await;
            result
        })
    }

    pub fn into_stream<T>(mut self) -> impl Stream<Item = DriverResult<T>> + Send
    where
        T: DeserializeOwned + Send + 'static,
    {
        async_stream::try_stream! {
            while let Some(doc) = self.try_next::<T>().await? {
                yield doc;
            }
            self.close().await;
        }
    }

    async fn pull(&mut self, consume: bool) -> DriverResult<Option<Value>> {
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pulled = {
                let mut state = shared.state.lock();
                if state.closed {
                    return Ok(None);
                }
                if let Some(err) = &state.err {
                    return Err(err.clone());
                }

                let doc = if consume {
                    state.pop()
                } else {
                    state.front().cloned()
                };
                match doc {
                    Some(doc) => Pulled::Doc {
                        doc,
                        prefetch: state.batches.len() <= 1 && !state.finished,
                    },
                    None if state.finished => Pulled::End,
                    None => Pulled::Wait,
                }
            };

            match pulled {
                Pulled::Doc { doc, prefetch } => {
                    if prefetch {
                        self.fetch_more();
                    }
                    return Ok(Some(doc));
                }
                Pulled::End => return Ok(None),
                Pulled::Wait => self.fetch_more(),
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.ctx.done() => {
                    let err = self.ctx.error();
                    self.abandon(Some(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// Issue a CONTINUE unless one is already in flight or the stream is over
    fn fetch_more(&self) {
        if self
            .shared
            .fetching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        {
            let state = self.shared.state.lock();
            if state.finished || state.closed || state.err.is_some() {
                self.shared.fetching.store(false, Ordering::Release);
                return;
            }
        }

        let sent = match self.conn.upgrade() {
            Some(conn) => conn.send_continue(self.shared.token),
            None => Err(DriverError::ConnectionClosed),
        };
        if let Err(e) = sent {
            self.shared.fail(e);
        }
    }

    fn decode<T: DeserializeOwned>(&self, mut doc: Value) -> DriverResult<T> {
        if !self.use_json_number {
            fold_numbers(&mut doc);
        }
        Ok(serde_json::from_value(doc)?)
    }

    // ==================== Closing ====================

    /// Stop the stream. Sends a STOP when the server still holds results for
    /// this cursor and waits for it to be acknowledged, as long as the
    /// cursor's context and connection stay alive. Safe to call repeatedly.
    pub async fn close(&mut self) {
        let send_stop = match self.mark_closed(None) {
            Some(send_stop) => send_stop,
            None => return,
        };

        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        if !send_stop || conn.send_stop(self.shared.token).is_err() {
            conn.remove_cursor(self.shared.token);
            return;
        }

        let shutdown = conn.shutdown_token();
        drop(conn);
        self.wait_finished(&shutdown).await;

        if let Some(conn) = self.conn.upgrade() {
            conn.remove_cursor(self.shared.token);
        }
    }

    async fn wait_finished(&self, shutdown: &CancellationToken) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.state.lock().finished {
                return;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.ctx.done() => return,
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Flag the cursor closed. Returns whether a STOP is owed, `None` if it was already closed.
    fn mark_closed(&self, err: Option<DriverError>) -> Option<bool> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        if let Some(err) = err {
            state.set_err(err);
        }
        state.closed = true;
        state.batches.clear();
        Some(!state.finished)
    }

    /// Close without waiting for the server
    fn abandon(&self, err: Option<DriverError>) {
        let Some(send_stop) = self.mark_closed(err) else {
            return;
        };
        if let Some(conn) = self.conn.upgrade() {
            if send_stop {
                let _ = conn.send_stop(self.shared.token);
            }
            conn.remove_cursor(self.shared.token);
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.abandon(None);
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("token", &self.shared.token)
            .field("kind", &self.kind)
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// Documents of a first reply. An atom holding an array is iterated element by element.
fn take_documents(response: &mut Response) -> Vec<Value> {
    let mut docs = std::mem::take(&mut response.responses);
    let atom = response.response_type() == Some(ResponseType::SuccessAtom);
    if atom && docs.len() == 1 && docs[0].is_array() {
        if let Some(Value::Array(items)) = docs.pop() {
            return items;
        }
    }
    docs
}

/// Turn every number outside the 64-bit integer range into a double.
///
/// Frames keep the digits the server sent; without `use_json_number` callers
/// see the same values a plain JSON parse would give them.
fn fold_numbers(value: &mut Value) {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => {
            if let Some(folded) = n.as_f64().and_then(Number::from_f64) {
                *n = folded;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(fold_numbers),
        Value::Object(fields) => fields.values_mut().for_each(fold_numbers),
        _ => {}
    }
}
