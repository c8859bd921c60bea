mod error;
mod stream;

pub mod env;
pub mod gateway;
pub mod model;
pub mod providers;
pub mod types;
pub mod utils;

pub use env::{Env, parse_dotenv};
pub use error::{BrokerError, Result};
pub use model::{CompletionModel, FragmentStream};
pub use providers::{OpenAiChat, OpenAiConfig};
pub use stream::{AbortableStream, StreamAbortHandle, abortable_stream, collect_fragments};
pub use types::{ChatMessage, ChatModel, CompletionRequest, DEFAULT_TEMPERATURE};
