use tl::{HTMLTag, VDom};

pub fn parse(html: &str) -> Result<VDom, tl::ParseError> {
  tl::parse(html, tl::ParserOptions::default())
}

pub fn select_tags<'d>(dom: &'d VDom<'d>, selector: &str) -> Vec<&'d HTMLTag<'d>> {
  dom
    .query_selector(selector)
    .map(|iter| {
      iter
        .filter_map(|node| node.get(dom.parser()).and_then(|node| node.as_tag()))
        .collect()
    })
    .unwrap_or_default()
}

pub fn select_first<'d>(dom: &'d VDom<'d>, selector: &str) -> Option<&'d HTMLTag<'d>> {
  select_tags(dom, selector).into_iter().next()
}

pub fn inner_text(dom: &VDom, tag: &HTMLTag) -> String {
  let text = tag.inner_text(dom.parser()).trim().to_string();
  htmlescape::decode_html(&text).unwrap_or(text)
}

pub fn attr(tag: &HTMLTag, name: &str) -> Option<String> {
  tag
    .attributes()
    .get(name)
    .flatten()
    .map(|value| value.as_utf8_str().trim().to_string())
}

pub fn meta_content(dom: &VDom, name: &str) -> Option<String> {
  select_tags(dom, "meta")
    .into_iter()
    .find(|tag| {
      attr(tag, "name")
        .map(|n| n.eq_ignore_ascii_case(name))
        .unwrap_or(false)
    })
    .and_then(|tag| attr(tag, "content"))
}
