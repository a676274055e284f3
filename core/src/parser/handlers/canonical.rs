use crate::parser::dom;
use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value};

pub struct CanonicalHandler;

fn trim_trailing_slash(url: &str) -> &str {
  url.trim_end_matches('/')
}

impl TaskHandler for CanonicalHandler {
  fn task_type(&self) -> &'static str {
    "canonical_extraction"
  }

  fn field_name(&self) -> &'static str {
    "canonical_data"
  }

  fn extract(&self, html: &str, ctx: &TaskContext) -> Result<Value, TaskError> {
    let dom = dom::parse(html).map_err(|e| TaskError::Fail(format!("HTML parse failed: {}", e)))?;

    let href = dom::select_tags(&dom, "link")
      .into_iter()
      .find(|tag| {
        dom::attr(tag, "rel")
          .map(|rel| rel.eq_ignore_ascii_case("canonical"))
          .unwrap_or(false)
      })
      .and_then(|tag| dom::attr(tag, "href"))
      .filter(|href| !href.is_empty());

    let is_self_referencing = href
      .as_deref()
      .map(|href| trim_trailing_slash(href) == trim_trailing_slash(&ctx.url))
      .unwrap_or(false);

    Ok(json!({
      "href": href,
      "present": href.is_some(),
      "is_self_referencing": is_self_referencing,
    }))
  }
}
