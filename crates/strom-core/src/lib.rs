pub mod cursor;
pub mod error;
pub mod event;
pub mod metrics;
pub mod partition;
pub mod subscription;

pub use cursor::{Cursor, CursorComparator, PartitionKey, TimelineCursorComparator};
pub use error::{Error, Result};
pub use event::{ConsumedEvent, EventCategory, HeaderTag};
pub use partition::{Partition, PartitionState};
pub use subscription::{
    StreamParameters, Subscription, SubscriptionAnnotations, UnprocessableEventPolicy,
};
