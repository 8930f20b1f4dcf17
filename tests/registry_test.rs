use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskq_rs::registry::{self, Handler, HandlerError, HandlerRegistry, HandlerResult};

#[tokio::test]
async fn add_sums_integers() {
    assert_eq!(registry::add(vec![json!(2), json!(3)]).await, Ok(json!(5)));
    assert_eq!(registry::add(vec![]).await, Ok(json!(0)));
    assert_eq!(registry::add(vec![json!(-4), json!(1)]).await, Ok(json!(-3)));
}

#[tokio::test]
async fn add_promotes_to_float() {
    assert_eq!(registry::add(vec![json!(1.5), json!(2)]).await, Ok(json!(3.5)));
}

#[tokio::test]
async fn add_rejects_non_numbers() {
    let err = registry::add(vec![json!(1), json!("two")]).await.unwrap_err();
    assert!(matches!(err, HandlerError::Fatal(_)));
}

#[tokio::test]
async fn add_overflow_is_fatal() {
    let err = registry::add(vec![json!(i64::MAX), json!(1)]).await.unwrap_err();
    assert_eq!(err, HandlerError::Fatal("integer overflow".to_string()));
}

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn execute(&self, args: Vec<Value>) -> HandlerResult {
        Ok(Value::Array(args))
    }
}

#[tokio::test]
async fn registry_routes_by_task_type() {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(Echo));
    registry.register_fn("fail", |_args: Vec<Value>| async {
        Err(HandlerError::Retriable("later".to_string()))
    });

    assert!(registry.contains("echo"));
    assert!(!registry.contains("add"));
    assert!(registry.get("missing").is_none());
    assert_eq!(registry.task_types(), vec!["echo", "fail"]);

    let echo = registry.get("echo").unwrap();
    assert_eq!(echo.execute(vec![json!(1)]).await, Ok(json!([1])));

    let fail = registry.get("fail").unwrap();
    assert!(matches!(
        fail.execute(vec![]).await,
        Err(HandlerError::Retriable(_))
    ));
}

#[test]
fn builtin_registry_has_add() {
    assert_eq!(registry::builtin().task_types(), vec!["add"]);
}
