//! Partitioned, stateful stream processing.
//!
//! Keyed events flow through a partitioned log:
//!
//! ```text
//! Emitter -> input topic -> Processor -> "{group}-table" changelog -> View -> GET /{key}
//! ```
//!
//! A [`Processor`] folds each event into the per-key [`Aggregate`] held in a
//! local [`StateStore`] shard, republishes the new value to the changelog,
//! and then commits the input offset. Shards are rebuilt from the changelog
//! after a crash or a rebalance. A [`View`] replays the changelog into its
//! own shards and answers point lookups, which [`query`] exposes over HTTP.

mod aggregate;
mod broker;
mod clicks;
mod codec;
mod config;
mod emitter;
mod error;
mod group;
mod layout;
mod live;
mod processor;
mod quarantine;
pub mod query;
mod record;
mod retry;
mod store;
mod view;

pub use aggregate::{Aggregate, fold};
pub use broker::{Broker, PartitionReader};
pub use clicks::UserClicks;
pub use codec::{Codec, JsonCodec, StringCodec};
pub use config::Config;
pub use emitter::{Emitter, KeyRotation, now_payload, run_ticker};
pub use error::{
    CodecError, ConfigError, EmitError, LogError, ProcessError, StoreError, ViewError,
};
pub use group::{Assignment, GroupCoordinator, GroupDescription, Lease, Membership};
pub use layout::DataLayout;
pub use live::LiveConfig;
pub use processor::{
    PartitionState, Processor, ProcessorBuilder, ProcessorHandle, changelog_topic,
};
pub use quarantine::{DeadLetter, PoisonPolicy, Quarantine, read_dead_letters};
pub use record::{
    Record, RecordPosition, SOURCE_OFFSET_HEADER, TopicPartition, partition_for,
};
pub use retry::RetryPolicy;
pub use store::{
    FileStore, FileStores, MemoryStore, MemoryStores, StateStore, StoreCheckpoint,
    StoreFactory, Table,
};
pub use view::{ReadPolicy, View, ViewBuilder, ViewHandle, ViewState};
