//! Toy executor answering a handful of hard-wired operations.
//!
//! Operations are recognized by the root field named in the document:
//!
//! - `hello`: query resolving to `"world"`
//! - `echo`: query returning its `message` variable
//! - `counter`: subscription yielding `{"counter": n}` for `n` in `1..=to`
//!   (`to` variable, default 5), one item per interval

use std::time::Duration;

use async_trait::async_trait;
use gqlws_core::execution::{ExecutionError, Executor, ResultStream};
use gqlws_core::graphql::{GraphQLError, GraphQLRequest, GraphQLResult};
use serde_json::{Value, json};

const DEFAULT_COUNT: u64 = 5;

/// Executor backing the demo binary.
#[derive(Debug, Clone)]
pub struct DemoExecutor {
    tick: Duration,
}

impl DemoExecutor {
    /// Subscriptions emit one item every `tick`.
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }
}

fn root_field(request: &GraphQLRequest) -> Option<&str> {
    let body = request.query.split_once('{')?.1;
    body.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|word| !word.is_empty())
}

fn variable<'a>(request: &'a GraphQLRequest, name: &str) -> Option<&'a Value> {
    request.variables.as_ref().and_then(|vars| vars.get(name))
}

#[async_trait]
impl Executor for DemoExecutor {
    fn is_subscription(&self, request: &GraphQLRequest) -> bool {
        request.query.trim_start().starts_with("subscription")
    }

    async fn execute(&self, request: GraphQLRequest) -> Result<GraphQLResult, ExecutionError> {
        match root_field(&request) {
            Some("hello") => Ok(GraphQLResult::data(json!({ "hello": "world" }))),
            Some("echo") => {
                let message = variable(&request, "message").cloned().unwrap_or(Value::Null);
                Ok(GraphQLResult::data(json!({ "echo": message })))
            }
            Some(other) => Ok(GraphQLResult::from_errors(vec![GraphQLError::new(format!(
                "Cannot query field \"{other}\" on type \"Query\"."
            ))])),
            None => Err(ExecutionError::Engine("Syntax Error: no selection set".into())),
        }
    }

    async fn subscribe(&self, request: GraphQLRequest) -> Result<ResultStream, ExecutionError> {
        match root_field(&request) {
            Some("counter") => {
                let to = variable(&request, "to")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_COUNT);
                let tick = self.tick;
                Ok(Box::pin(async_stream::stream! {
                    for n in 1..=to {
                        yield Ok(GraphQLResult::data(json!({ "counter": n })));
                        if n < to {
                            tokio::time::sleep(tick).await;
                        }
                    }
                }))
            }
            Some(other) => Err(ExecutionError::GraphQL(GraphQLError::new(format!(
                "Cannot query field \"{other}\" on type \"Subscription\"."
            )))),
            None => Err(ExecutionError::Engine("Syntax Error: no selection set".into())),
        }
    }
}
