use rulewatch_sync::Filter;
use serde_json::Value;

/// Inclusive `created_at` window shared by the aggregation tasks.
///
/// Bounds are passed to the store untouched, so an Elasticsearch backend may
/// use date math such as `now-1d`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchWindow {
    pub gte: Option<Value>,
    pub lte: Option<Value>,
}

impl SearchWindow {
    pub fn new(gte: Option<Value>, lte: Option<Value>) -> Self {
        Self { gte, lte }
    }

    pub fn is_open(&self) -> bool {
        self.gte.is_none() && self.lte.is_none()
    }

    pub fn restrict(&self, filter: Filter) -> Filter {
        if self.is_open() {
            return filter;
        }
        filter.range("created_at", self.gte.clone(), self.lte.clone())
    }
}
