use crate::parser::dom;
use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value};

pub struct MetaDescriptionHandler;

impl TaskHandler for MetaDescriptionHandler {
  fn task_type(&self) -> &'static str {
    "meta_description_extraction"
  }

  fn field_name(&self) -> &'static str {
    "meta_description_data"
  }

  fn extract(&self, html: &str, _ctx: &TaskContext) -> Result<Value, TaskError> {
    let dom = dom::parse(html).map_err(|e| TaskError::Fail(format!("HTML parse failed: {}", e)))?;

    let content = dom::meta_content(&dom, "description").filter(|c| !c.is_empty());
    let length = content.as_deref().map(|c| c.chars().count()).unwrap_or(0);

    Ok(json!({
      "content": content,
      "length": length,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ctx() -> TaskContext {
    TaskContext {
      document_id: "doc-1".to_string(),
      url: "https://example.com/".to_string(),
      domain: Some("example.com".to_string()),
    }
  }

  #[test]
  fn test_extracts_description() {
    let html = r#"<head><meta name="Description" content="A fine page."></head>"#;
    let value = MetaDescriptionHandler.extract(html, &ctx()).unwrap();
    assert_eq!(value["content"], "A fine page.");
    assert_eq!(value["length"], 12);
  }

  #[test]
  fn test_absent_description() {
    let value = MetaDescriptionHandler
      .extract("<head></head>", &ctx())
      .unwrap();
    assert_eq!(value["content"], Value::Null);
  }
}
