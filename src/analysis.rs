// 💳 Card analysis pipeline
// upload -> extract -> normalize -> validate -> duplicate check -> insert
//
// Every collaborator is passed in, so tests swap the uploader and extractor
// for fakes and pin the clock.

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{BlobUploader, CardExtractor};
use crate::db::{CardRecord, CardStore};
use crate::error::{AnalysisError, StoreError};
use crate::normalizer::{
    mask_card_number, CandidateFields, FieldNormalizer, NamePolicy, RawExtraction,
};
use crate::query::QueryGateway;
use crate::validation::{CardValidator, Verdict};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Inserted { id: i64 },
    AlreadyExists { id: i64 },
}

impl AnalysisOutcome {
    pub fn id(&self) -> i64 {
        match self {
            AnalysisOutcome::Inserted { id } | AnalysisOutcome::AlreadyExists { id } => *id,
        }
    }
}

/// Everything the UI shows after a successful analysis
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub image_url: String,
    pub fields: CandidateFields,
    pub verdict: Verdict,
    pub outcome: AnalysisOutcome,
}

pub struct CardAnalyzer {
    uploader: Box<dyn BlobUploader>,
    extractor: Box<dyn CardExtractor>,
    normalizer: FieldNormalizer,
    validator: CardValidator,
    store: Arc<CardStore>,
}

impl CardAnalyzer {
    pub fn new(
        uploader: Box<dyn BlobUploader>,
        extractor: Box<dyn CardExtractor>,
        store: Arc<CardStore>,
    ) -> Self {
        CardAnalyzer::with_clock(uploader, extractor, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        uploader: Box<dyn BlobUploader>,
        extractor: Box<dyn CardExtractor>,
        store: Arc<CardStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        CardAnalyzer {
            uploader,
            extractor,
            normalizer: FieldNormalizer::new(Arc::clone(&clock)),
            validator: CardValidator::new(clock),
            store,
        }
    }

    /// Builder pattern: holder-name cleanup policy
    pub fn with_name_policy(mut self, policy: NamePolicy) -> Self {
        self.normalizer = self.normalizer.with_policy(policy);
        self
    }

    pub fn store(&self) -> &Arc<CardStore> {
        &self.store
    }

    pub fn query_gateway(&self) -> QueryGateway {
        QueryGateway::new(Arc::clone(&self.store))
    }

    /// Normalize and validate without touching the store
    pub fn check(&self, raw: &RawExtraction) -> (CandidateFields, Verdict) {
        let fields = self.normalizer.normalize(raw);
        let verdict = self.validator.validate(&fields);
        (fields, verdict)
    }

    pub fn analyze(&self, bytes: &[u8], filename: &str) -> Result<Analysis, AnalysisError> {
        let image_url = self
            .uploader
            .upload(bytes, filename)
            .ok_or(AnalysisError::Upload)?;

        let raw = self
            .extractor
            .extract(&image_url)
            .filter(|raw| !raw.is_empty())
            .ok_or(AnalysisError::Extraction)?;

        let (fields, verdict) = self.check(&raw);
        let masked = mask_card_number(&fields.card_number);

        if !verdict.is_valid {
            warn!(card = %masked, reasons = %verdict.summary(), "card rejected");
            return Err(AnalysisError::Invalid { fields, verdict });
        }

        let outcome = self.persist(&fields, &verdict)?;
        info!(card = %masked, id = outcome.id(), ?outcome, "card analyzed");

        Ok(Analysis {
            image_url,
            fields,
            verdict,
            outcome,
        })
    }

    fn persist(
        &self,
        fields: &CandidateFields,
        verdict: &Verdict,
    ) -> Result<AnalysisOutcome, StoreError> {
        if let Some(existing) = self.store.get_by_card_number(&fields.card_number)? {
            if let Some(id) = existing.id {
                return Ok(AnalysisOutcome::AlreadyExists { id });
            }
        }

        let record = CardRecord::from_verdict(fields.clone(), verdict)?;

        // A concurrent insert can still win between the lookup and here
        match self.store.insert(&record) {
            Ok(id) => Ok(AnalysisOutcome::Inserted { id }),
            Err(StoreError::DuplicateKey { existing_id, .. }) => {
                Ok(AnalysisOutcome::AlreadyExists { id: existing_id })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::validation::Rule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeUploader {
        fail: bool,
    }

    impl BlobUploader for FakeUploader {
        fn upload(&self, _bytes: &[u8], filename: &str) -> Option<String> {
            (!self.fail).then(|| format!("memory://{}", filename))
        }
    }

    struct FakeExtractor {
        result: Option<RawExtraction>,
        calls: Arc<AtomicUsize>,
    }

    impl CardExtractor for FakeExtractor {
        fn extract(&self, _image_url: &str) -> Option<RawExtraction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn test_store() -> Arc<CardStore> {
        Arc::new(
            CardStore::open_in_memory()
                .unwrap()
                .with_clock(Arc::new(FixedClock::at(2030, 1))),
        )
    }

    fn card(number: &str, expiry: &str) -> RawExtraction {
        RawExtraction::new()
            .with_field("CardNumber", number)
            .with_field("ExpirationDate", expiry)
            .with_field("CardHolderName", "GABRIEL LIMA")
            .with_field("IssuingBank", "Bank X")
    }

    fn analyzer(
        upload_fails: bool,
        extraction: Option<RawExtraction>,
        store: Arc<CardStore>,
    ) -> (CardAnalyzer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let analyzer = CardAnalyzer::with_clock(
            Box::new(FakeUploader { fail: upload_fails }),
            Box::new(FakeExtractor {
                result: extraction,
                calls: Arc::clone(&calls),
            }),
            store,
            Arc::new(FixedClock::at(2030, 1)),
        );
        (analyzer, calls)
    }

    #[test]
    fn test_valid_card_inserted_then_reported_existing() {
        let store = test_store();
        let (analyzer, _) = analyzer(
            false,
            Some(card("4532 0151 1283 0366", "01/30")),
            Arc::clone(&store),
        );

        let first = analyzer.analyze(b"img", "card.png").unwrap();
        assert!(matches!(first.outcome, AnalysisOutcome::Inserted { .. }));
        assert_eq!(first.image_url, "memory://card.png");

        let second = analyzer.analyze(b"img", "card.png").unwrap();
        assert_eq!(
            second.outcome,
            AnalysisOutcome::AlreadyExists {
                id: first.outcome.id()
            }
        );
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_card_not_written() {
        let store = test_store();
        let (analyzer, _) = analyzer(
            false,
            Some(card("4532015112830367", "12/29")),
            Arc::clone(&store),
        );

        match analyzer.analyze(b"img", "card.png") {
            Err(AnalysisError::Invalid { fields, verdict }) => {
                assert_eq!(fields.card_number, "4532015112830367");
                assert!(verdict.failed(Rule::Checksum));
                assert!(verdict.failed(Rule::ExpiryNotPast));
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_upload_failure_skips_extraction() {
        let store = test_store();
        let (analyzer, calls) = analyzer(true, Some(card("4111111111111111", "05/31")), store);

        assert!(matches!(
            analyzer.analyze(b"img", "card.png"),
            Err(AnalysisError::Upload)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_extraction_failure_writes_nothing() {
        let store = test_store();
        let (analyzer, calls) = analyzer(false, None, Arc::clone(&store));

        assert!(matches!(
            analyzer.analyze(b"img", "card.png"),
            Err(AnalysisError::Extraction)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.count().unwrap(), 0);

        let (empty, _) = analyzer_with_empty(Arc::clone(&store));
        assert!(matches!(
            empty.analyze(b"img", "card.png"),
            Err(AnalysisError::Extraction)
        ));
    }

    fn analyzer_with_empty(store: Arc<CardStore>) -> (CardAnalyzer, Arc<AtomicUsize>) {
        analyzer(false, Some(RawExtraction::new()), store)
    }

    #[test]
    fn test_name_policy_applies() {
        let store = test_store();
        let (analyzer, _) = analyzer(false, None, store);
        let analyzer = analyzer.with_name_policy(NamePolicy {
            strip_punctuation: true,
            uppercase: true,
        });

        let raw = RawExtraction::new().with_field("name", "gabriel  o'lima");
        let (fields, _) = analyzer.check(&raw);
        assert_eq!(fields.holder_name, "GABRIEL OLIMA");
    }

    #[test]
    fn test_query_gateway_sees_inserted_cards() {
        let store = test_store();
        let (analyzer, _) = analyzer(false, Some(card("4111111111111111", "05/31")), store);
        analyzer.analyze(b"img", "card.png").unwrap();

        let rows = analyzer
            .query_gateway()
            .execute("SELECT card_number FROM cards")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["card_number"], serde_json::Value::from("4111111111111111"));
    }
}
