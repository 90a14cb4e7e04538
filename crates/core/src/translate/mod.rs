//! Translation client seam.
//! A [`Translator`] turns a batch of units into one result per unit; the
//! [`retry::RetryingTranslator`] wraps it with backoff and identity rotation.

use crate::error::TranslateError;
use crate::model::{TranslationResult, TranslationUnit};
use async_trait::async_trait;

pub mod http;
pub mod retry;

/// One outbound request to the backend.
#[derive(Debug, Clone, Copy)]
pub struct TranslateRequest<'a> {
    pub units: &'a [TranslationUnit],
    pub src_lang: &'a str,
    pub target_lang: &'a str,
    /// Client identity presented to the backend (sent as the user agent).
    pub identity: &'a str,
}

/// Stateless text translation capability.
///
/// Implementations return exactly one result per input unit, in input order.
/// Per-unit problems are `Failed` results; only conditions that doom the whole
/// request are errors.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        request: TranslateRequest<'_>,
    ) -> Result<Vec<TranslationResult>, TranslateError>;
}

#[async_trait]
impl<T: Translator + ?Sized> Translator for std::sync::Arc<T> {
    async fn translate(
        &self,
        request: TranslateRequest<'_>,
    ) -> Result<Vec<TranslationResult>, TranslateError> {
        (**self).translate(request).await
    }
}

/// Pair backend texts with their units, turning missing or empty answers for
/// non-blank source into `Failed` results.
pub(crate) fn pair_results(
    units: &[TranslationUnit],
    texts: Vec<Option<String>>,
) -> Result<Vec<TranslationResult>, TranslateError> {
    if texts.len() != units.len() {
        return Err(TranslateError::retryable(format!(
            "backend returned {} translations for {} texts",
            texts.len(),
            units.len()
        )));
    }
    Ok(units
        .iter()
        .zip(texts)
        .map(|(unit, text)| match text {
            Some(t) if !t.trim().is_empty() => TranslationResult::success(&unit.id, t),
            _ if unit.is_blank() => TranslationResult::success(&unit.id, ""),
            Some(_) => TranslationResult::failed(&unit.id, "empty translation"),
            None => TranslationResult::failed(&unit.id, "no translation returned"),
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stub backends shared by the tests of several modules.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Prefixes every text and records which unit ids and identities it saw.
    #[derive(Clone, Default)]
    pub struct PrefixTr {
        pub sent: Arc<Mutex<Vec<String>>>,
        pub identities: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Translator for PrefixTr {
        async fn translate(
            &self,
            request: TranslateRequest<'_>,
        ) -> Result<Vec<TranslationResult>, TranslateError> {
            self.identities
                .lock()
                .unwrap()
                .push(request.identity.to_string());
            let mut sent = self.sent.lock().unwrap();
            Ok(request
                .units
                .iter()
                .map(|u| {
                    sent.push(u.id.clone());
                    TranslationResult::success(&u.id, format!("pt:{}", u.source_text.trim()))
                })
                .collect())
        }
    }

    /// Replays scripted errors before answering like [`PrefixTr`].
    #[derive(Clone, Default)]
    pub struct ScriptedTr {
        pub script: Arc<Mutex<VecDeque<TranslateError>>>,
        pub calls: Arc<Mutex<u32>>,
        pub inner: PrefixTr,
    }

    impl ScriptedTr {
        pub fn failing(errors: Vec<TranslateError>) -> Self {
            Self {
                script: Arc::new(Mutex::new(errors.into())),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Translator for ScriptedTr {
        async fn translate(
            &self,
            request: TranslateRequest<'_>,
        ) -> Result<Vec<TranslationResult>, TranslateError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(err) => {
                    self.inner
                        .identities
                        .lock()
                        .unwrap()
                        .push(request.identity.to_string());
                    Err(err)
                }
                None => self.inner.translate(request).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OffsetSpan;

    fn tu(id: &str, text: &str) -> TranslationUnit {
        TranslationUnit {
            id: id.into(),
            source_text: text.into(),
            spans: vec![OffsetSpan {
                unit_index: 1,
                range: 0..text.len(),
                local_offset: 0,
            }],
        }
    }

    #[test]
    fn pairs_texts_and_marks_empty_answers_failed() {
        let units = vec![tu("a", "Hello"), tu("b", "World"), tu("c", " "), tu("d", "x")];
        let results = pair_results(
            &units,
            vec![Some("Olá".into()), Some("".into()), None, None],
        )
        .unwrap();
        assert!(results[0].is_success());
        assert_eq!(results[0].translated_text, "Olá");
        assert!(!results[1].is_success());
        assert!(results[2].is_success());
        assert!(!results[3].is_success());
        assert_eq!(results[3].id, "d");
    }

    #[test]
    fn count_mismatch_is_retryable() {
        let units = vec![tu("a", "Hello")];
        let err = pair_results(&units, vec![]).unwrap_err();
        assert!(err.is_retryable());
    }
}
