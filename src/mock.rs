//! Scripted [`QueryExecutor`] for tests of code that runs queries
//!
//! ```rust
//! use docdb::mock::{Mock, MockQuery};
//! use docdb::{Context, QueryExecutor};
//! use serde_json::{json, Map};
//!
//! # tokio_test::block_on(async {
//! let mock = Mock::new();
//! mock.on(MockQuery::new(json!([15, ["users"]])).returns(vec![json!({"id": 1})]));
//!
//! let q = mock.new_query(json!([15, ["users"]]), Map::new());
//! let mut cursor = mock.query(&Context::background(), q).await.unwrap().unwrap();
//! let user: serde_json::Value = cursor.one().await.unwrap();
//! assert_eq!(user["id"], 1);
//! mock.assert_expectations().unwrap();
//! # });
//! ```

use async_trait::async_trait;
use docdb_proto::{Query, ServerResponse};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::driver::Cursor;
use crate::error::{DriverError, DriverResult};
use crate::executor::QueryExecutor;

#[derive(Debug, Clone)]
enum MockResult {
    Documents(Vec<Value>),
    Error(DriverError),
}

/// One expected query and what to answer it with
#[derive(Debug, Clone)]
pub struct MockQuery {
    term: Value,
    opts: Option<Map<String, Value>>,
    result: MockResult,
    times: Option<usize>,
    executed: usize,
}

impl MockQuery {
    pub fn new(term: Value) -> Self {
        Self {
            term,
            opts: None,
            result: MockResult::Documents(Vec::new()),
            times: None,
            executed: 0,
        }
    }

    /// Only match queries carrying exactly these optargs
    pub fn with_opts(mut self, opts: Map<String, Value>) -> Self {
        self.opts = Some(opts);
        self
    }

    pub fn returns(mut self, docs: Vec<Value>) -> Self {
        self.result = MockResult::Documents(docs);
        self
    }

    pub fn returns_error(mut self, err: DriverError) -> Self {
        self.result = MockResult::Error(err);
        self
    }

    /// Match at most `n` times
    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    pub fn once(self) -> Self {
        self.times(1)
    }

    fn matches(&self, q: &Query) -> bool {
        q.term.as_ref() == Some(&self.term)
            && self.opts.as_ref().map_or(true, |opts| *opts == q.opts)
            && self.times.map_or(true, |n| self.executed < n)
    }

    fn satisfied(&self) -> bool {
        match self.times {
            Some(n) => self.executed == n,
            None => self.executed > 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Mock {
    expectations: Mutex<Vec<MockQuery>>,
    server: Option<ServerResponse>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity returned by [`QueryExecutor::server`]
    pub fn with_server(mut self, server: ServerResponse) -> Self {
        self.server = Some(server);
        self
    }

    pub fn on(&self, query: MockQuery) -> &Self {
        self.expectations.lock().push(query);
        self
    }

    /// Fail if an expectation was not met
    pub fn assert_expectations(&self) -> DriverResult<()> {
        let missing: Vec<String> = self
            .expectations
            .lock()
            .iter()
            .filter(|e| !e.satisfied())
            .map(|e| match e.times {
                Some(n) => format!("{} ({} of {} calls)", e.term, e.executed, n),
                None => format!("{} (never called)", e.term),
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DriverError::Driver(format!(
                "unmet mock expectations: {}",
                missing.join(", ")
            )))
        }
    }
}

#[async_trait]
impl QueryExecutor for Mock {
    fn is_connected(&self) -> bool {
        true
    }

    async fn query(&self, _ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        let result = {
            let mut expectations = self.expectations.lock();
            let Some(expectation) = expectations.iter_mut().find(|e| e.matches(&q)) else {
                return Err(DriverError::Driver(format!(
                    "unexpected query: {}",
                    q.term.unwrap_or(Value::Null)
                )));
            };
            expectation.executed += 1;
            expectation.result.clone()
        };

        match result {
            MockResult::Documents(docs) => Ok(Some(Cursor::from_documents(docs))),
            MockResult::Error(err) => Err(err),
        }
    }

    async fn server(&self, _ctx: &Context) -> DriverResult<ServerResponse> {
        self.server
            .clone()
            .ok_or_else(|| DriverError::Driver("mock has no server identity".to_string()))
    }
}
