use serde_json::{json, Map, Value};

use crate::types::QueryType;

/// A query ready to be written to a connection.
///
/// The term is an already-built AST in its wire form
/// (`[term_type, [args...], {optargs}]`); this crate never inspects it.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub token: u64,
    pub query_type: QueryType,
    pub term: Option<Value>,
    pub opts: Map<String, Value>,
}

impl Query {
    /// A START query for `term` with global optargs `opts`
    pub fn start(term: Value, opts: Map<String, Value>) -> Self {
        Self {
            token: 0,
            query_type: QueryType::Start,
            term: Some(term),
            opts,
        }
    }

    pub fn continue_query(token: u64) -> Self {
        Self::control(QueryType::Continue, token)
    }

    pub fn stop(token: u64) -> Self {
        Self::control(QueryType::Stop, token)
    }

    pub fn noreply_wait() -> Self {
        Self::control(QueryType::NoreplyWait, 0)
    }

    pub fn server_info() -> Self {
        Self::control(QueryType::ServerInfo, 0)
    }

    fn control(query_type: QueryType, token: u64) -> Self {
        Self {
            token,
            query_type,
            term: None,
            opts: Map::new(),
        }
    }

    /// Whether the caller asked the server not to reply
    pub fn is_noreply(&self) -> bool {
        self.opts
            .get("noreply")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Set the `db` optarg unless the query already carries one
    pub fn with_default_db(mut self, database: Option<&str>) -> Self {
        if let Some(db) = database {
            if self.query_type == QueryType::Start && !self.opts.contains_key("db") {
                self.opts.insert("db".to_string(), db_term(db));
            }
        }
        self
    }

    /// JSON body as sent on the wire
    pub fn body(&self) -> Value {
        match self.query_type {
            QueryType::Start => json!([
                self.query_type.code(),
                self.term.clone().unwrap_or(Value::Null),
                Value::Object(self.opts.clone()),
            ]),
            _ => json!([self.query_type.code()]),
        }
    }
}

/// Term tree for `r.db(name)`
pub fn db_term(name: &str) -> Value {
    const DB: i64 = 14;
    json!([DB, [name]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_body() {
        let mut opts = Map::new();
        opts.insert("profile".to_string(), json!(true));
        let query = Query::start(json!([39, [[15, ["users"]]]]), opts);

        assert_eq!(
            query.body(),
            json!([1, [39, [[15, ["users"]]]], {"profile": true}])
        );
    }

    #[test]
    fn test_control_bodies() {
        assert_eq!(Query::continue_query(7).body(), json!([2]));
        assert_eq!(Query::stop(7).body(), json!([3]));
        assert_eq!(Query::noreply_wait().body(), json!([4]));
        assert_eq!(Query::server_info().body(), json!([5]));
        assert_eq!(Query::stop(7).token, 7);
    }

    #[test]
    fn test_noreply_flag() {
        let mut opts = Map::new();
        assert!(!Query::start(json!(1), opts.clone()).is_noreply());
        opts.insert("noreply".to_string(), json!(true));
        assert!(Query::start(json!(1), opts).is_noreply());
    }

    #[test]
    fn test_default_db_does_not_override() {
        let query = Query::start(json!(1), Map::new()).with_default_db(Some("app"));
        assert_eq!(query.opts["db"], json!([14, ["app"]]));

        let mut opts = Map::new();
        opts.insert("db".to_string(), db_term("other"));
        let query = Query::start(json!(1), opts).with_default_db(Some("app"));
        assert_eq!(query.opts["db"], json!([14, ["other"]]));

        let query = Query::stop(3).with_default_db(Some("app"));
        assert!(query.opts.is_empty());
    }
}
