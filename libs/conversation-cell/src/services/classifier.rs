// libs/conversation-cell/src/services/classifier.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use shared_config::AppConfig;

use crate::error::ClassifierError;
use crate::models::{Classification, Intent};

/// Decides what an opening message wants. Only consulted at the start of a
/// conversation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, message: &str, context: &str) -> Result<Classification, ClassifierError>;
}

/// Lowercase, accents folded, whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'Á' | 'À' | 'Ä' => 'a',
            'é' | 'è' | 'ë' | 'É' | 'È' | 'Ë' => 'e',
            'í' | 'ì' | 'ï' | 'Í' | 'Ì' | 'Ï' => 'i',
            'ó' | 'ò' | 'ö' | 'Ó' | 'Ò' | 'Ö' => 'o',
            'ú' | 'ù' | 'ü' | 'Ú' | 'Ù' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ==============================================================================
// KEYWORD CLASSIFIER
// ==============================================================================

const BOOKING_KEYWORDS: [&str; 8] = [
    "hora", "agendar", "agenda", "reservar", "reserva", "cita", "turno", "consulta",
];

const HANDOFF_KEYWORDS: [&str; 7] = [
    "humano", "persona", "ejecutivo", "recepcion", "secretaria", "operador", "hablar con",
];

#[derive(Debug, Clone, Default)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    pub fn classify_text(&self, message: &str) -> Classification {
        let text = normalize_text(message);

        if HANDOFF_KEYWORDS.iter().any(|k| text.contains(k)) {
            return Classification::of(Intent::Handoff);
        }
        if BOOKING_KEYWORDS.iter().any(|k| text.contains(k)) {
            return Classification::of(Intent::Booking);
        }
        Classification::of(Intent::General)
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, message: &str, _context: &str) -> Result<Classification, ClassifierError> {
        Ok(self.classify_text(message))
    }
}

// ==============================================================================
// GENERATIVE CLASSIFIER
// ==============================================================================

const SYSTEM_PROMPT: &str = "Eres el asistente de WhatsApp de un centro médico. \
Clasifica el mensaje del paciente. Responde solo JSON con la forma \
{\"intent\": \"booking\" | \"handoff\" | \"general\", \"say\": string | null}. \
Usa booking si quiere agendar, handoff si pide hablar con una persona y general \
en otro caso; para general escribe en say una respuesta breve y cordial en español.";

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat-completions endpoint returning a JSON classification. Any failure
/// falls back to keyword matching.
pub struct GenerativeIntentClassifier {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    fallback: KeywordIntentClassifier,
}

impl GenerativeIntentClassifier {
    pub fn new(config: &AppConfig) -> Result<Self, ClassifierError> {
        let (Some(api_url), Some(api_key)) = (&config.classifier_api_url, &config.classifier_api_key) else {
            return Err(ClassifierError::NotConfigured);
        };

        Ok(Self {
            client: Client::new(),
            api_url: api_url.clone(),
            api_key: api_key.clone(),
            model: config.classifier_model.clone(),
            fallback: KeywordIntentClassifier,
        })
    }

    async fn request(&self, message: &str, context: &str) -> Result<Classification, ClassifierError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": format!("{}\n\n{}", SYSTEM_PROMPT, context) },
                { "role": "user", "content": message },
            ],
        });

        let response = self.client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ClassifierError::InvalidResponse("no choices".to_string()))?;

        serde_json::from_str(content.trim())
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl IntentClassifier for GenerativeIntentClassifier {
    #[instrument(skip(self, message, context))]
    async fn classify(&self, message: &str, context: &str) -> Result<Classification, ClassifierError> {
        match self.request(message, context).await {
            Ok(classification) => {
                debug!("Classified as {:?}", classification.intent);
                Ok(classification)
            }
            Err(e) => {
                warn!("Generative classification failed, using keywords: {}", e);
                Ok(self.fallback.classify_text(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_utils::test_utils::TestConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalisation_folds_accents_and_case() {
        assert_eq!(normalize_text("  Quiero   AGENDAR una Cita, ¿sí? "), "quiero agendar una cita, ¿si?");
        assert_eq!(normalize_text("Menú"), "menu");
    }

    #[test]
    fn keywords_pick_the_intent() {
        let classifier = KeywordIntentClassifier;
        assert_eq!(classifier.classify_text("Hola, necesito una hora").intent, Intent::Booking);
        assert_eq!(classifier.classify_text("Quiero hablar con una persona").intent, Intent::Handoff);
        assert_eq!(classifier.classify_text("¿Dónde están ubicados?").intent, Intent::General);
    }

    fn generative(server: &MockServer) -> GenerativeIntentClassifier {
        let mut config = TestConfig::default().to_app_config();
        config.classifier_api_url = Some(format!("{}/v1/chat/completions", server.uri()));
        config.classifier_api_key = Some("sk-test".into());
        GenerativeIntentClassifier::new(&config).unwrap()
    }

    #[tokio::test]
    async fn generative_classifier_parses_json_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "{\"intent\":\"general\",\"say\":\"Atendemos de 8 a 18.\"}" } }]
            })))
            .mount(&server)
            .await;

        let result = generative(&server).classify("¿horario?", "").await.unwrap();
        assert_eq!(result.intent, Intent::General);
        assert_eq!(result.say.as_deref(), Some("Atendemos de 8 a 18."));
    }

    #[tokio::test]
    async fn generative_failure_falls_back_to_keywords() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = generative(&server).classify("quiero reservar", "").await.unwrap();
        assert_eq!(result, Classification::of(Intent::Booking));
    }

    #[test]
    fn unconfigured_generative_classifier_is_rejected() {
        let config = TestConfig::default().to_app_config();
        assert!(matches!(
            GenerativeIntentClassifier::new(&config),
            Err(ClassifierError::NotConfigured)
        ));
    }
}
