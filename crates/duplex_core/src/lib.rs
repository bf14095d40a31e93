pub mod aligned_buffer;
pub mod audit;
pub mod digest;
mod error;
pub mod memory;
pub mod partition;
pub mod pipeline;
pub mod reader;
pub mod report;
pub mod ring;
pub mod settings;
mod traits;
pub mod transform;

pub use aligned_buffer::AlignedBuffer;
pub use audit::{AuditSink, MemoryAudit, WriterAudit};
pub use digest::{BlockDigest, DigestAlgorithm, FinalDigest};
pub use error::{CoreError, Result, SinkError, TransformError};
pub use partition::{Classification, DecoderState, PartitionDecoder, PartitionEntry, partition_type_name};
pub use pipeline::{CancellationToken, Pipeline, ProgressCallback, ProgressEvent};
pub use reader::{ErrorRegion, StreamCounters};
pub use report::{JobReport, SinkReport, StreamReport, TransformFailure};
pub use settings::{JobSettings, SECTOR_SIZE};
pub use traits::{Sink, Source};
pub use transform::{Transform, TransformDecision, TransformErrorHandler};
