pub mod cache;
pub mod classifier;
pub mod driver;
pub mod machine;
pub mod store;
pub mod transport;

pub use cache::{CachedDirectory, TtlCache};
pub use classifier::{GenerativeIntentClassifier, IntentClassifier, KeywordIntentClassifier};
pub use driver::ConversationDriver;
pub use machine::ConversationMachine;
pub use store::{ConversationStore, InMemoryConversationStore, RedisConversationStore};
pub use transport::{MessageTransport, WhatsAppCancellationNotifier, WhatsAppClient};
