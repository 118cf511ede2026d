pub mod adaptor;
pub mod cache;
pub mod channel;
pub mod clock;
pub mod config;
mod error;
#[cfg(feature = "gateway")]
pub mod http;
pub mod ledger;
pub mod observability;
pub mod order;
pub mod pricing;
pub mod relay;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod utils;

pub use error::{RelayError, Result};

pub use adaptor::{AdaptorRegistry, RelayInfo, TaskAdaptor, TaskRequest, TaskSubmission};
pub use channel::{Channel, ChannelRegistry, ChannelSelector, ChannelStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Env, RelayConfig};
pub use ledger::{QuotaLedger, Reservation, ReserveRequest, Settlement};
pub use observability::Observability;
pub use order::{OrderStatus, PaymentService, TopUpOrder};
pub use pricing::{PriceQuote, PricingTable};
pub use relay::{Caller, RelayOrchestrator, RelayRequest, RelayResponse};
pub use store::{LedgerStore, MemoryStore, OrderStore, StoreError, TaskStore};
pub use task::{Task, TaskPoller, TaskService, TaskStatus};

#[cfg(feature = "gateway")]
pub use http::{RelayHttpState, router};
