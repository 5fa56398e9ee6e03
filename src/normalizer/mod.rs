// src/normalizer/mod.rs

pub mod rules;

use crate::classifier::{Classification, Classifier};
use crate::error::StoreResult;
use crate::models::{NormalizationSource, NormalizedProduct, Unit};
use crate::store::{OTHER_CATEGORY, Store, name_key};
use std::sync::Arc;
use tracing::{debug, warn};

/// Line-item normalizer: cache, then rule tables, then the AI classifier.
///
/// Classifier answers and the degraded fallback are cached, so a description
/// keeps its canonical name for good. A fallback entry stays provisional until
/// the classifier confidently supplies its category.
pub struct Normalizer {
    classifier: Option<Arc<dyn Classifier>>,
    min_confidence: f64,
}

impl Normalizer {
    pub fn new(classifier: Option<Arc<dyn Classifier>>, min_confidence: f64) -> Self {
        Self {
            classifier,
            min_confidence,
        }
    }

    pub async fn normalize(
        &self,
        store: &Store,
        raw_description: &str,
        raw_unit: &str,
    ) -> StoreResult<NormalizedProduct> {
        let cleaned = rules::clean(raw_description);
        let unit = rules::canonical_unit(raw_unit).unwrap_or(if cleaned.sold_by_weight {
            Unit::Kilogram
        } else {
            Unit::Each
        });
        let description_key = rules::fold(raw_description);

        let product = |canonical_name: String, category: String, source| NormalizedProduct {
            canonical_name,
            category,
            unit,
            brand: cleaned.brand.clone(),
            size: cleaned.size.clone(),
            source,
        };

        if let Some(cached) = store.cached_normalization(&description_key)? {
            if !cached.provisional {
                return Ok(product(cached.canonical_name, cached.category, NormalizationSource::Cache));
            }
            if let Some(c) = self.classify(raw_description).await {
                let category = category_or_other(c.category);
                if category != OTHER_CATEGORY
                    && store.confirm_provisional_normalization(&description_key, &category)?
                {
                    return Ok(product(cached.canonical_name, category, NormalizationSource::Classifier));
                }
            }
            return Ok(match store.cached_normalization(&description_key)? {
                Some(current) if !current.provisional => {
                    product(current.canonical_name, current.category, NormalizationSource::Cache)
                }
                _ => product(cached.canonical_name, cached.category, NormalizationSource::Fallback),
            });
        }

        if !cleaned.name.is_empty() {
            if let Some(category) = rules::category_for(&cleaned.name) {
                return Ok(product(
                    cleaned.name.clone(),
                    category.to_string(),
                    NormalizationSource::Rules,
                ));
            }
        }

        if let Some(c) = self.classify(raw_description).await {
            let name = rules::fold(&c.canonical_name);
            let stored =
                store.cache_normalization(&description_key, &name, &category_or_other(c.category), false)?;
            debug!(description = %raw_description, canonical = %stored.canonical_name, "Normalized by classifier");
            let source = if stored.canonical_name == name {
                NormalizationSource::Classifier
            } else {
                NormalizationSource::Cache
            };
            return Ok(product(stored.canonical_name, stored.category, source));
        }

        let stored = store.cache_normalization(
            &description_key,
            &name_key(raw_description),
            OTHER_CATEGORY,
            true,
        )?;
        let source = if stored.provisional {
            NormalizationSource::Fallback
        } else {
            NormalizationSource::Cache
        };
        Ok(product(stored.canonical_name, stored.category, source))
    }

    /// A confident, usable classifier answer, or `None` with the degradation logged.
    async fn classify(&self, raw_description: &str) -> Option<Classification> {
        let Some(classifier) = &self.classifier else {
            warn!(description = %raw_description, "Normalization degraded: no classifier configured");
            return None;
        };
        match classifier.classify(raw_description).await {
            Ok(c) if c.confidence >= self.min_confidence && !name_key(&c.canonical_name).is_empty() => Some(c),
            Ok(c) => {
                warn!(
                    description = %raw_description,
                    confidence = c.confidence,
                    "Normalization degraded: low classifier confidence"
                );
                None
            }
            Err(e) => {
                warn!(description = %raw_description, error = %e, "Normalization degraded: classifier unavailable");
                None
            }
        }
    }
}

fn category_or_other(category: String) -> String {
    if category.trim().is_empty() {
        OTHER_CATEGORY.to_string()
    } else {
        category
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ServiceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier {
        answer: Option<Classification>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _description: &str) -> Result<Classification, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .clone()
                .ok_or_else(|| ServiceError::Unavailable("offline".to_string()))
        }
    }

    fn normalizer(answer: Option<Classification>) -> (Normalizer, Arc<FixedClassifier>) {
        let classifier = Arc::new(FixedClassifier {
            answer,
            calls: AtomicUsize::new(0),
        });
        (Normalizer::new(Some(classifier.clone()), 0.5), classifier)
    }

    #[tokio::test]
    async fn test_rules_match_skips_classifier() {
        let store = Store::open_in_memory().unwrap();
        let (n, classifier) = normalizer(None);

        let p = n.normalize(&store, "Milho Verde Predileto 170g", "un").await.unwrap();
        assert_eq!(p.canonical_name, "MILHO VERDE PREDILETO");
        assert_eq!(p.category, "GROCERY");
        assert_eq!(p.unit, Unit::Each);
        assert_eq!(p.brand.as_deref(), Some("PREDILETO"));
        assert_eq!(p.source, NormalizationSource::Rules);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_classifier_answer_is_cached() {
        let store = Store::open_in_memory().unwrap();
        let (n, classifier) = normalizer(Some(Classification {
            canonical_name: "Salgadinho Elma Chips".to_string(),
            category: "GROCERY".to_string(),
            confidence: 0.9,
        }));

        let first = n.normalize(&store, "SALG ELMA CHIPS 90G", "UN").await.unwrap();
        let second = n.normalize(&store, "SALG ELMA CHIPS 90G", "UN").await.unwrap();

        assert_eq!(first.canonical_name, "SALGADINHO ELMA CHIPS");
        assert_eq!(first.source, NormalizationSource::Classifier);
        assert_eq!(second.canonical_name, first.canonical_name);
        assert_eq!(second.source, NormalizationSource::Cache);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_classifier_falls_back_to_raw() {
        let store = Store::open_in_memory().unwrap();
        let (n, classifier) = normalizer(None);

        let p = n.normalize(&store, "  salg  elma chips ", "xx").await.unwrap();
        assert_eq!(p.canonical_name, "SALG ELMA CHIPS");
        assert_eq!(p.category, OTHER_CATEGORY);
        assert_eq!(p.unit, Unit::Each);
        assert_eq!(p.source, NormalizationSource::Fallback);

        // the provisional entry keeps the name; the classifier is asked again for a category
        let again = n.normalize(&store, "salg elma chips", "un").await.unwrap();
        assert_eq!(again.canonical_name, "SALG ELMA CHIPS");
        assert_eq!(again.source, NormalizationSource::Fallback);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fallback_name_survives_classifier_recovery() {
        let store = Store::open_in_memory().unwrap();
        let (offline, _) = normalizer(None);
        let degraded = offline.normalize(&store, "SALG ELMA CHIPS 90G", "UN").await.unwrap();
        assert_eq!(degraded.source, NormalizationSource::Fallback);
        let id = store
            .resolve_or_create(&degraded.canonical_name, &degraded.category, degraded.unit)
            .unwrap();

        let (online, classifier) = normalizer(Some(Classification {
            canonical_name: "Salgadinho Elma Chips".to_string(),
            category: "GROCERY".to_string(),
            confidence: 0.9,
        }));
        let upgraded = online.normalize(&store, "SALG ELMA CHIPS 90G", "UN").await.unwrap();
        assert_eq!(upgraded.canonical_name, degraded.canonical_name);
        assert_eq!(upgraded.category, "GROCERY");
        assert_eq!(upgraded.source, NormalizationSource::Classifier);

        let settled = online.normalize(&store, "SALG ELMA CHIPS 90G", "UN").await.unwrap();
        assert_eq!(settled.canonical_name, degraded.canonical_name);
        assert_eq!(settled.source, NormalizationSource::Cache);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

        let resolved = store
            .resolve_or_create(&settled.canonical_name, &settled.category, settled.unit)
            .unwrap();
        assert_eq!(resolved, id);
        assert_eq!(store.product_count().unwrap(), 1);
        assert_eq!(store.product(id).unwrap().unwrap().category, "GROCERY");
    }

    #[tokio::test]
    async fn test_low_confidence_is_degraded() {
        let store = Store::open_in_memory().unwrap();
        let (n, _) = normalizer(Some(Classification {
            canonical_name: "COISA".to_string(),
            category: "GROCERY".to_string(),
            confidence: 0.2,
        }));
        let p = n.normalize(&store, "XPTO 123", "un").await.unwrap();
        assert_eq!(p.source, NormalizationSource::Fallback);
        assert_eq!(p.canonical_name, "XPTO 123");
    }

    #[tokio::test]
    async fn test_sold_by_weight_unit() {
        let store = Store::open_in_memory().unwrap();
        let n = Normalizer::new(None, 0.5);
        let p = n.normalize(&store, "BANANA PRATA KG", "").await.unwrap();
        assert_eq!(p.canonical_name, "BANANA PRATA");
        assert_eq!(p.unit, Unit::Kilogram);
        assert_eq!(p.category, "PRODUCE");
    }
}
