pub mod bloom_filter;
pub mod datastore;
pub mod online_state;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterSpec};
pub use datastore::{
    stream_pair, Datastore, InMemoryDatastore, ListenRequest, ServerStream, StreamHandle,
    WatchRequest, WatchServerStream, WatchStreamHandle, WriteRequest, WriteResponse,
    WriteServerStream, WriteStreamHandle,
};
pub use online_state::{OnlineState, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use watch_change::{
    DocumentChange, ExistenceFilter, TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
