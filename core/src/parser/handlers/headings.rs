use crate::parser::dom;
use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value};

pub struct HeadingsHandler;

impl TaskHandler for HeadingsHandler {
  fn task_type(&self) -> &'static str {
    "headings_extraction"
  }

  fn field_name(&self) -> &'static str {
    "headings_data"
  }

  fn extract(&self, html: &str, _ctx: &TaskContext) -> Result<Value, TaskError> {
    let dom = dom::parse(html).map_err(|e| TaskError::Fail(format!("HTML parse failed: {}", e)))?;

    let mut counts = serde_json::Map::new();
    let mut total = 0u32;
    let mut h1_values: Vec<String> = Vec::new();

    for level in 1..=6u8 {
      let selector = format!("h{}", level);
      let tags = dom::select_tags(&dom, &selector);
      let count = tags.len() as u32;
      total += count;
      if level == 1 {
        h1_values = tags
          .iter()
          .map(|tag| dom::inner_text(&dom, tag))
          .filter(|text| !text.is_empty())
          .collect();
      }
      counts.insert(selector, json!(count));
    }

    Ok(json!({
      "counts": counts,
      "h1_values": h1_values,
      "total": total,
      "multiple_h1": h1_values.len() > 1,
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
  fn test_counts_headings_per_level() {
    let html = "<body><h1>Main</h1><h2>A</h2><h2>B</h2><h3>C</h3></body>";
    let value = HeadingsHandler.extract(html, &ctx()).unwrap();
    assert_eq!(value["counts"]["h1"], 1);
    assert_eq!(value["counts"]["h2"], 2);
    assert_eq!(value["counts"]["h3"], 1);
    assert_eq!(value["total"], 4);
    assert_eq!(value["h1_values"][0], "Main");
    assert_eq!(value["multiple_h1"], false);
  }

  #[test]
  fn test_flags_multiple_h1() {
    let html = "<body><h1>One</h1><h1>Two</h1></body>";
    let value = HeadingsHandler.extract(html, &ctx()).unwrap();
    assert_eq!(value["multiple_h1"], true);
  }
}
