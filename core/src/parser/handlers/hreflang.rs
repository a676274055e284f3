use crate::parser::dom;
use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value};

pub struct HreflangHandler;

impl TaskHandler for HreflangHandler {
  fn task_type(&self) -> &'static str {
    "hreflang_extraction"
  }

  fn field_name(&self) -> &'static str {
    "hreflang_data"
  }

  fn extract(&self, html: &str, _ctx: &TaskContext) -> Result<Value, TaskError> {
    let dom = dom::parse(html).map_err(|e| TaskError::Fail(format!("HTML parse failed: {}", e)))?;

    let entries: Vec<Value> = dom::select_tags(&dom, "link")
      .into_iter()
      .filter(|tag| {
        dom::attr(tag, "rel")
          .map(|rel| rel.eq_ignore_ascii_case("alternate"))
          .unwrap_or(false)
      })
      .filter_map(|tag| {
        let lang = dom::attr(tag, "hreflang")?;
        let href = dom::attr(tag, "href")?;
        Some(json!({ "lang": lang, "href": href }))
      })
      .collect();

    let has_x_default = entries
      .iter()
      .any(|entry| entry["lang"].as_str() == Some("x-default"));

    Ok(json!({
      "count": entries.len(),
      "entries": entries,
      "has_x_default": has_x_default,
    }))
  }
}
