pub mod cancel;
pub mod config;
pub mod error;
pub mod lsn;
pub mod mapper;
pub mod postgres;
pub mod subscription;

pub use cancel::{cancellation, CancelRx, CancelTx};
pub use config::Config;
pub use error::{Error, Result};
pub use lsn::Lsn;
pub use mapper::{DataMapper, FlatObjectMapper, JsonMapper, MappingErrorPolicy, NameTransformation};
pub use postgres::{ChangeKind, CreateReplicationSlotResult, CreateStyle, RowChange};
pub use subscription::{subscribe, MappedEvent, Subscription, SubscriptionOptions, SubscriptionState};
