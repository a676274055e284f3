use super::handlers::{
  canonical::CanonicalHandler, headings::HeadingsHandler, hreflang::HreflangHandler,
  links::LinksHandler, meta_description::MetaDescriptionHandler, page_title::PageTitleHandler,
};
use super::task_handler::TaskHandler;
use crate::queue::job_queue::JobPriority;
use crate::queue::queue_manager::parser_tube;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

#[derive(Clone, Debug)]
pub struct TaskSettings {
  pub priority: JobPriority,
  pub ttr: Duration,
  pub instances: u32,
}

impl Default for TaskSettings {
  fn default() -> Self {
    Self {
      priority: JobPriority::Normal,
      ttr: Duration::from_secs(120),
      instances: 1,
    }
  }
}

#[derive(Clone)]
pub struct RegisteredTask {
  pub settings: TaskSettings,
  pub handler: Arc<dyn TaskHandler>,
}

/// Static table of parser task types. Handlers register at startup; the
/// worker runtime and the fan-out dispatcher only ever consult this table.
#[derive(Clone, Default)]
pub struct TaskRegistry {
  tasks: BTreeMap<&'static str, RegisteredTask>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self {
      tasks: BTreeMap::new(),
    }
  }

  pub fn register(&mut self, handler: Arc<dyn TaskHandler>, settings: TaskSettings) {
    self
      .tasks
      .insert(handler.task_type(), RegisteredTask { settings, handler });
  }

  pub fn get(&self, task_type: &str) -> Option<&RegisteredTask> {
    self.tasks.get(task_type)
  }

  pub fn tasks(&self) -> impl Iterator<Item = (&'static str, &RegisteredTask)> {
    self.tasks.iter().map(|(task_type, task)| (*task_type, task))
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn tubes(&self) -> Vec<String> {
    self.tasks.keys().map(|task_type| parser_tube(task_type)).collect()
  }

  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(
      Arc::new(PageTitleHandler),
      TaskSettings {
        instances: 2,
        ..Default::default()
      },
    );
    registry.register(Arc::new(MetaDescriptionHandler), TaskSettings::default());
    registry.register(
      Arc::new(HeadingsHandler),
      TaskSettings {
        ttr: Duration::from_secs(150),
        ..Default::default()
      },
    );
    registry.register(Arc::new(CanonicalHandler), TaskSettings::default());
    registry.register(Arc::new(HreflangHandler), TaskSettings::default());
    registry.register(
      Arc::new(LinksHandler),
      TaskSettings {
        ttr: Duration::from_secs(180),
        ..Default::default()
      },
    );
    registry
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_cover_all_tubes() {
    let registry = TaskRegistry::with_defaults();
    assert_eq!(registry.len(), 6);
    assert!(registry.get("page_title_extraction").is_some());
    assert!(registry.get("unknown_extraction").is_none());
    assert!(registry
      .tubes()
      .contains(&"crawler_htmlparser_links_extraction_tube".to_string()));
  }

  #[test]
  fn test_registration_is_open_for_extension() {
    use crate::parser::task_handler::{TaskContext, TaskError, TaskHandler};
    use serde_json::Value;

    struct AmpHandler;
    impl TaskHandler for AmpHandler {
      fn task_type(&self) -> &'static str {
        "amp_extraction"
      }
      fn field_name(&self) -> &'static str {
        "amp_data"
      }
      fn extract(&self, _html: &str, _ctx: &TaskContext) -> Result<Value, TaskError> {
        Ok(Value::Null)
      }
    }

    let mut registry = TaskRegistry::with_defaults();
    registry.register(Arc::new(AmpHandler), TaskSettings::default());
    assert_eq!(registry.len(), 7);
    assert!(registry.get("amp_extraction").is_some());
  }
}
