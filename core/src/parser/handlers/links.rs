use crate::parser::dom;
use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value};

pub struct LinksHandler;

fn link_host(href: &str, base: &reqwest::Url) -> Option<String> {
  base
    .join(href)
    .ok()
    .and_then(|url| url.host_str().map(|h| h.to_string()))
}

impl TaskHandler for LinksHandler {
  fn task_type(&self) -> &'static str {
    "links_extraction"
  }

  fn field_name(&self) -> &'static str {
    "links_data"
  }

  fn extract(&self, html: &str, ctx: &TaskContext) -> Result<Value, TaskError> {
    let dom = dom::parse(html).map_err(|e| TaskError::Fail(format!("HTML parse failed: {}", e)))?;
    let base = reqwest::Url::parse(&ctx.url)
      .map_err(|e| TaskError::Fail(format!("Invalid page url {}: {}", ctx.url, e)))?;
    let page_host = base.host_str().unwrap_or_default().to_string();

    let mut internal = 0u32;
    let mut external = 0u32;
    let mut nofollow = 0u32;
    let mut total = 0u32;

    for tag in dom::select_tags(&dom, "a") {
      let Some(href) = dom::attr(tag, "href") else {
        continue;
      };
      if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        continue;
      }
      total += 1;

      match link_host(&href, &base) {
        Some(host) if host == page_host => internal += 1,
        Some(_) => external += 1,
        None => internal += 1,
      }

      let is_nofollow = dom::attr(tag, "rel")
        .map(|rel| rel.to_lowercase().contains("nofollow"))
        .unwrap_or(false);
      if is_nofollow {
        nofollow += 1;
      }
    }

    Ok(json!({
      "total": total,
      "internal": internal,
      "external": external,
      "nofollow": nofollow,
    }))
  }
}
