pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod frame;
pub mod models;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use api::ChatApi;
pub use config::{ClientSettings, ConfigError};
pub use credentials::{Credential, CredentialStore, RefreshOutcome, TokenRefresher};
pub use error::{ClientError, ClientResult};
pub use event::{parse_frame, EventStream, StreamEvent};
pub use frame::FrameDecoder;
pub use models::{Conversation, ConversationRef, Message, MessageRole};
pub use session::{ChatSession, Completion, GenerationOutcome, SessionUpdate};
pub use state::{ChatSnapshot, ConversationStateMachine, Transition};
pub use store::CredentialFile;
pub use transport::{ApiRequest, TokenGuardedTransport};
