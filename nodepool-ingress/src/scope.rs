use std::collections::BTreeMap;

use kube::{ResourceExt, api::DynamicObject};
use nodepool_ingress_templates::{POOL_LABEL, TemplateParams};

/// Label pair tagging every object of one node pool's addon instance.
///
/// Creation labels, list selectors and the ownership check all derive from
/// this single value, so an operation for one pool can never touch objects of
/// another pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolScope {
    pool: String,
}

impl PoolScope {
    /// The pool name is used verbatim as label value.
    pub(crate) fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
        }
    }

    pub(crate) fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(POOL_LABEL.to_string(), self.pool.clone());
        labels
    }

    /// Equality based label selector, e.g. `nodepool_name=hangzhou`.
    pub(crate) fn selector(&self) -> String {
        format!("{}={}", POOL_LABEL, self.pool)
    }

    pub(crate) fn params(&self) -> TemplateParams {
        TemplateParams::for_pool(&self.pool)
    }

    /// Exact match on the scope label, no prefix or partial matching.
    pub(crate) fn matches(&self, obj: &DynamicObject) -> bool {
        obj.labels().get(POOL_LABEL).map(|v| v.as_str()) == Some(self.pool.as_str())
    }
}

impl std::fmt::Display for PoolScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", POOL_LABEL, self.pool)
    }
}
