use crate::parser::dom;
use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value};

pub struct PageTitleHandler;

impl TaskHandler for PageTitleHandler {
  fn task_type(&self) -> &'static str {
    "page_title_extraction"
  }

  fn field_name(&self) -> &'static str {
    "page_title"
  }

  fn extract(&self, html: &str, _ctx: &TaskContext) -> Result<Value, TaskError> {
    let dom = dom::parse(html).map_err(|e| TaskError::Fail(format!("HTML parse failed: {}", e)))?;

    let title = dom::select_first(&dom, "title")
      .map(|tag| dom::inner_text(&dom, tag))
      .filter(|title| !title.is_empty());
    let title_length = title.as_deref().map(|t| t.chars().count()).unwrap_or(0);

    Ok(json!({
      "title": title,
      "title_length": title_length,
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
  fn test_extracts_title_and_length() {
    let html = "<html><head><title>  Widgets &amp; More </title></head><body></body></html>";
    let value = PageTitleHandler.extract(html, &ctx()).unwrap();
    assert_eq!(value["title"], "Widgets & More");
    assert_eq!(value["title_length"], 14);
  }

  #[test]
  fn test_missing_title_yields_null() {
    let value = PageTitleHandler
      .extract("<html><head></head><body>x</body></html>", &ctx())
      .unwrap();
    assert_eq!(value["title"], Value::Null);
    assert_eq!(value["title_length"], 0);
  }
}
