//! Client-side sink adapter: speaks the exchange against a sync service.
//!
//! [`Sink`] is the capability set the orchestrator needs from the remote
//! side. [`StoreSink`] implements it against an in-process [`SyncService`],
//! streaming each exchange through a bounded channel so neither whole files
//! nor whole patch streams are ever buffered.

use std::io::Read;
use std::sync::mpsc;

use tracing::debug;

use crate::delta::{generate_delta, DeltaEvent};
use crate::diff::FilePatchOp;
use crate::error::{EspejoError, Result};
use crate::relpath::SyncPath;
use crate::service::{CreateStep, FileBlockPatch, PatchStep, SyncService};
use crate::strong::{HasherId, StreamHasher};
use crate::sum::FileInfo;
use crate::tree::DirSum;

/// Smallest permitted content-block size for create uploads.
pub const MIN_CREATE_BLOCK_SIZE: usize = 10 << 10;

/// Default content-block size for create uploads.
pub const DEFAULT_CREATE_BLOCK_SIZE: usize = 256 << 10;

/// Steps queued per exchange before the producer blocks.
const EXCHANGE_CHANNEL_DEPTH: usize = 16;

/// The remote capability set a sync run drives.
pub trait Sink: Send + Sync {
    /// Whole-tree summary of the sink.
    fn get_signatures(&self) -> Result<DirSum>;

    /// Create a file (streaming `content`) or a directory (content unused).
    fn create(&self, parent: &SyncPath, info: &FileInfo, content: &mut (dyn Read + Send))
        -> Result<()>;

    /// Re-content an existing file by streaming a delta of `source` against
    /// the op's sink summary.
    fn patch_file(&self, op: &FilePatchOp, source: &mut (dyn Read + Send)) -> Result<()>;

    /// Update a directory's metadata.
    fn patch_dir(&self, path: &SyncPath, info: &FileInfo) -> Result<()>;

    /// Remove a batch of paths in one call.
    fn delete_paths(&self, paths: &[SyncPath]) -> Result<()>;
}

/// [`Sink`] adapter over an in-process [`SyncService`].
#[derive(Debug)]
pub struct StoreSink<'a> {
    service: &'a SyncService,
    create_block_size: usize,
}

impl<'a> StoreSink<'a> {
    /// Adapt a service with the default upload block size.
    #[must_use]
    pub fn new(service: &'a SyncService) -> Self {
        Self {
            service,
            create_block_size: DEFAULT_CREATE_BLOCK_SIZE,
        }
    }

    /// Adapt a service with a custom upload block size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` below [`MIN_CREATE_BLOCK_SIZE`].
    pub fn with_create_block_size(service: &'a SyncService, block_size: usize) -> Result<Self> {
        if block_size < MIN_CREATE_BLOCK_SIZE {
            return Err(EspejoError::InvalidArgument(format!(
                "create block size must be at least {MIN_CREATE_BLOCK_SIZE}, got {block_size}"
            )));
        }
        Ok(Self {
            service,
            create_block_size: block_size,
        })
    }

    /// Run one exchange: a producer thread feeds steps through a bounded
    /// channel while the service consumes them. The service's verdict wins
    /// over producer-side errors, which are usually just broken sends after
    /// the service bailed out.
    fn run_exchange<T, P>(&self, produce: P, consume: impl FnOnce(mpsc::IntoIter<T>) -> Result<()>) -> Result<()>
    where
        T: Send,
        P: FnOnce(mpsc::SyncSender<T>) -> Result<()> + Send,
    {
        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel(EXCHANGE_CHANNEL_DEPTH);
            let producer = scope.spawn(move || produce(tx));
            let served = consume(rx.into_iter());
            let produced = producer
                .join()
                .map_err(|_| EspejoError::InvalidArgument("exchange producer panicked".to_string()))?;
            match (served, produced) {
                (Ok(()), Ok(())) => Ok(()),
                // A producer error other than a broken send is the root
                // cause (the service only saw a truncated step stream).
                (_, Err(e)) if !matches!(e, EspejoError::Cancelled) => Err(e),
                (Err(e), _) => Err(e),
                (Ok(()), Err(e)) => Err(e),
            }
        })
    }
}

fn send_step<T>(tx: &mpsc::SyncSender<T>, step: T) -> Result<()> {
    tx.send(step)
        .map_err(|_| EspejoError::Cancelled) // receiver gone: service already failed
}

impl Sink for StoreSink<'_> {
    fn get_signatures(&self) -> Result<DirSum> {
        self.service.get_signature()
    }

    fn create(
        &self,
        parent: &SyncPath,
        info: &FileInfo,
        content: &mut (dyn Read + Send),
    ) -> Result<()> {
        debug!(parent = %parent, file = %info.name, is_dir = info.is_dir, "create");

        let opening = CreateStep::Creating {
            parent: parent.clone(),
            info: info.clone(),
            hasher: HasherId::Blake3_64_256,
        };

        if info.is_dir {
            let closing = CreateStep::Closing {
                stream_sum: StreamHasher::new().finish().to_vec(),
            };
            return self.service.create([opening, closing]);
        }

        // Upload in bounded blocks no larger than the file itself needs.
        let block_size = usize::try_from(info.size)
            .unwrap_or(self.create_block_size)
            .clamp(1, self.create_block_size);

        self.run_exchange(
            move |tx| {
                send_step(&tx, opening)?;
                let mut hasher = StreamHasher::new();
                let mut block = vec![0u8; block_size];
                loop {
                    let n = crate::sum::read_block(content, &mut block)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&block[..n]);
                    send_step(
                        &tx,
                        CreateStep::Writing {
                            content_block: block[..n].to_vec(),
                        },
                    )?;
                }
                send_step(
                    &tx,
                    CreateStep::Closing {
                        stream_sum: hasher.finish().to_vec(),
                    },
                )
            },
            |steps| self.service.create(steps),
        )
    }

    fn patch_file(&self, op: &FilePatchOp, source: &mut (dyn Read + Send)) -> Result<()> {
        debug!(path = %op.path, "patch");

        let opening = PatchStep::Opening {
            parent: op.path.parent(),
            info: op.info.clone(),
            hasher: HasherId::Blake3_64_256,
            sink_sum: op.sink_sum.clone(),
        };
        let sink_sum = &op.sink_sum;

        self.run_exchange(
            move |tx| {
                send_step(&tx, opening)?;
                // Hash the source as the delta generator consumes it; the
                // generator reads to EOF, so the hash covers the whole file.
                let mut reader = HashingReader {
                    inner: source,
                    hasher: StreamHasher::new(),
                };
                generate_delta(&mut reader, sink_sum, |event| {
                    let patch = match event {
                        DeltaEvent::Literal(data) => FileBlockPatch::Data(data.to_vec()),
                        DeltaEvent::BlockRef(index) => FileBlockPatch::BlockRef(index),
                    };
                    send_step(&tx, PatchStep::Patching { patch })?;
                    Ok(0)
                })?;
                send_step(
                    &tx,
                    PatchStep::Closing {
                        stream_sum: reader.hasher.finish().to_vec(),
                    },
                )
            },
            |steps| self.service.patch(steps),
        )
    }

    fn patch_dir(&self, path: &SyncPath, info: &FileInfo) -> Result<()> {
        self.service.patch_dir(path, info)
    }

    fn delete_paths(&self, paths: &[SyncPath]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.service.delete_paths(paths)
    }
}

/// Reader that feeds everything it yields into a stream hasher.
struct HashingReader<R> {
    inner: R,
    hasher: StreamHasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
