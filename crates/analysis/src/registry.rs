use std::collections::HashMap;
use std::sync::Arc;

use crate::category::Category;
use crate::work::AnalysisWork;

/// Category → work function table.
///
/// Built once before the queue starts and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct WorkRegistry {
    works: HashMap<Category, Arc<dyn AnalysisWork>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the work function for `category`.
    pub fn register<W>(&mut self, category: Category, work: W) -> &mut Self
    where
        W: AnalysisWork,
    {
        self.works.insert(category, Arc::new(work));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<W>(mut self, category: Category, work: W) -> Self
    where
        W: AnalysisWork,
    {
        self.register(category, work);
        self
    }

    pub fn get(&self, category: &Category) -> Option<Arc<dyn AnalysisWork>> {
        self.works.get(category).cloned()
    }

    pub fn contains(&self, category: &Category) -> bool {
        self.works.contains_key(category)
    }

    /// Registered categories, sorted.
    pub fn categories(&self) -> Vec<Category> {
        let mut all: Vec<Category> = self.works.keys().cloned().collect();
        all.sort();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.works.is_empty()
    }
}

impl core::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("categories", &self.categories())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{AnalysisError, AnalysisResult};
    use crate::work::{AnalysisInput, work_fn};
    use crate::context::WorkContext;

    fn category(name: &str) -> Category {
        Category::new(name).unwrap()
    }

    fn constant(score: f64) -> impl AnalysisWork {
        work_fn(move |_input: AnalysisInput, _ctx: WorkContext| async move {
            Ok::<_, AnalysisError>(AnalysisResult::new(score, 1.0))
        })
    }

    #[test]
    fn lookup_by_category() {
        let registry = WorkRegistry::new()
            .with(category("pest_classification"), constant(1.0))
            .with(category("yield_prediction"), constant(2.0));

        assert!(registry.contains(&category("pest_classification")));
        assert!(registry.get(&category("soil_moisture")).is_none());
        assert_eq!(
            registry.categories(),
            vec![category("pest_classification"), category("yield_prediction")]
        );
    }

    #[test]
    fn registering_twice_replaces() {
        let mut registry = WorkRegistry::new();
        registry.register(category("pest_classification"), constant(1.0));
        registry.register(category("pest_classification"), constant(2.0));

        assert_eq!(registry.categories().len(), 1);
    }
}
