/*!
# qstreams-store: persisted state for the qstreams engine

This crate holds everything the stream engine writes to disk between restarts:

- stream definitions together with their last known lifecycle state
- per-stream delivery counters, flushed periodically by the engine

The records are plain `serde` types. Storage backends implement the
[`StateStore`] trait so the engine never touches the filesystem directly:

- [`storage::file::FileStore`]: one JSON document per stream, grouped in a
  `streams/` and a `metrics/` directory under a common root
- [`storage::memory::MemoryStore`]: process-local maps, for tests and
  embedding

## Usage

```rust,no_run
use qstreams_store::{FileStore, StateStore, StreamState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open("./data").await?;

    for record in store.list_streams().await? {
        if record.state == StreamState::Running {
            println!("{} ({}) was running", record.spec.name, record.spec.id);
        }
    }

    let metrics = store.load_all_metrics().await?;
    println!("metrics for {} stream(s)", metrics.len());
    Ok(())
}
```
*/

pub mod model;
pub mod storage;

pub use model::{
    DedupeConfig, DestinationConfig, SourceConfig, StreamMetrics, StreamRecord, StreamSpec,
    StreamState,
};
pub use storage::file::FileStore;
pub use storage::memory::MemoryStore;
pub use storage::{StateStore, StoreError};
