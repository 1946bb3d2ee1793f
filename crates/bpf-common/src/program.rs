//! [`Program`] wraps the pre-built kernel object loaded through aya.
//!
//! The object is loaded once; from it we derive:
//! - an [`AyaAttacher`], attaching and detaching its kprobes on demand;
//! - [`AyaTables`], a table backend checking declared tables against the
//!   maps found in the object and unpinning them on release;
//! - [`RingBufSource`]s, reading the records the probes emit.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use aya::{
    Ebpf, EbpfLoader,
    maps::{Map, MapData, RingBuf},
    programs::{KProbe, ProbeKind, kprobe::KProbeLinkId},
};
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
    bpf_fs::pinned_path,
    kernel_version::KernelVersion,
    probe::{AttachKind, ProbeAttacher},
    ring_buffer::RingBufSource,
    table::{TableBackend, TableError, TableSpec},
};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("loading object {path}")]
    LoadingObject {
        path: PathBuf,
        #[source]
        source: Box<aya::EbpfError>,
    },
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        source: BoxedError,
    },
    #[error("failed to attach {program} to {symbol}")]
    ProgramAttachError {
        program: String,
        symbol: String,
        #[source]
        source: BoxedError,
    },
    #[error("failed to detach {program}")]
    ProgramDetachError {
        program: String,
        #[source]
        source: BoxedError,
    },
    #[error(transparent)]
    MapError(#[from] Box<aya::maps::MapError>),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map already used {0}")]
    MapAlreadyUsed(String),
    #[error("registering ring buffer {map}")]
    RingBuffer {
        map: String,
        #[source]
        source: std::io::Error,
    },
    #[error("running background aya task {0}")]
    JoinError(#[from] JoinError),
}

/// Settings used when loading the kernel object.
#[derive(Debug, Clone)]
pub struct BpfContext {
    object_path: PathBuf,
    pin_path: PathBuf,
    kernel_version: KernelVersion,
}

impl BpfContext {
    pub fn new(object_path: impl Into<PathBuf>, pin_path: impl Into<PathBuf>) -> Self {
        let kernel_version = KernelVersion::autodetect().unwrap_or_else(|err| {
            log::warn!(
                "Error identifying kernel version {err:?}. Assuming kernel {}",
                KernelVersion::MINIMUM
            );
            KernelVersion::MINIMUM
        });
        Self {
            object_path: object_path.into(),
            pin_path: pin_path.into(),
            kernel_version,
        }
    }

    pub fn object_path(&self) -> &Path {
        &self.object_path
    }

    pub fn pin_path(&self) -> &Path {
        &self.pin_path
    }

    pub fn kernel_version(&self) -> &KernelVersion {
        &self.kernel_version
    }
}

/// The loaded kernel object.
pub struct Program {
    ctx: BpfContext,
    ebpf: Arc<Mutex<Ebpf>>,
    used_maps: HashSet<String>,
}

impl Program {
    /// Load the object from disk. Programs are loaded lazily on attach.
    pub async fn load(ctx: BpfContext) -> Result<Self, ProgramError> {
        let object_path = ctx.object_path.clone();
        let pin_path = ctx.pin_path.clone();
        let version_code = ctx.kernel_version.code();

        let ebpf = tokio::task::spawn_blocking(move || {
            EbpfLoader::new()
                .map_pin_path(&pin_path)
                .set_global("LINUX_KERNEL_VERSION", &version_code, false)
                .load_file(&object_path)
                .map_err(|err| ProgramError::LoadingObject {
                    path: object_path.clone(),
                    source: Box::new(err),
                })
        })
        .await??;

        log::debug!(
            "loaded {} (kernel {})",
            ctx.object_path.display(),
            ctx.kernel_version
        );
        Ok(Self {
            ctx,
            ebpf: Arc::new(Mutex::new(ebpf)),
            used_maps: HashSet::new(),
        })
    }

    pub fn ctx(&self) -> &BpfContext {
        &self.ctx
    }

    pub fn attacher(&self) -> AyaAttacher {
        AyaAttacher {
            ebpf: self.ebpf.clone(),
            loaded: HashSet::new(),
        }
    }

    pub fn tables(&self) -> AyaTables {
        AyaTables {
            ebpf: self.ebpf.clone(),
            pin_path: self.ctx.pin_path.clone(),
        }
    }

    /// Take ownership of a BPF_MAP_TYPE_RINGBUF and read its records.
    pub fn ring_buffer(&mut self, map_name: &str) -> Result<RingBufSource, ProgramError> {
        if !self.used_maps.insert(map_name.to_string()) {
            return Err(ProgramError::MapAlreadyUsed(map_name.to_string()));
        }
        let map = lock(&self.ebpf)
            .take_map(map_name)
            .ok_or_else(|| ProgramError::MapNotFound(map_name.to_string()))?;
        let ring = RingBuf::try_from(map).map_err(Box::new)?;
        RingBufSource::new(map_name, ring).map_err(|source| ProgramError::RingBuffer {
            map: map_name.to_string(),
            source,
        })
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        // only succeeds once every table has been unpinned
        let _ = std::fs::remove_dir(&self.ctx.pin_path);
    }
}

fn lock(ebpf: &Mutex<Ebpf>) -> MutexGuard<'_, Ebpf> {
    ebpf.lock().unwrap_or_else(PoisonError::into_inner)
}

fn extract_kprobe<'a>(ebpf: &'a mut Ebpf, program: &str) -> Result<&'a mut KProbe, ProgramError> {
    ebpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

/// Attaches the kprobes contained in the loaded object.
pub struct AyaAttacher {
    ebpf: Arc<Mutex<Ebpf>>,
    loaded: HashSet<String>,
}

pub struct AyaLink {
    program: String,
    link_id: KProbeLinkId,
}

impl ProbeAttacher for AyaAttacher {
    type Link = AyaLink;

    fn attach(
        &mut self,
        program: &str,
        kind: AttachKind,
        symbol: &str,
    ) -> Result<AyaLink, ProgramError> {
        let mut ebpf = lock(&self.ebpf);
        let kprobe = extract_kprobe(&mut ebpf, program)?;

        if !matches!(
            (kind, kprobe.kind()),
            (AttachKind::Entry, ProbeKind::KProbe) | (AttachKind::Exit, ProbeKind::KRetProbe)
        ) {
            return Err(ProgramError::ProgramTypeError(format!(
                "{program} is not a {kind}"
            )));
        }

        if !self.loaded.contains(program) {
            kprobe
                .load()
                .map_err(|err| ProgramError::ProgramLoadError {
                    program: program.to_string(),
                    source: Box::new(err),
                })?;
            self.loaded.insert(program.to_string());
        }

        let link_id = kprobe
            .attach(symbol, 0)
            .map_err(|err| ProgramError::ProgramAttachError {
                program: program.to_string(),
                symbol: symbol.to_string(),
                source: Box::new(err),
            })?;
        log::debug!("attached {kind} {program} to {symbol}");
        Ok(AyaLink {
            program: program.to_string(),
            link_id,
        })
    }

    fn detach(&mut self, link: AyaLink) -> Result<(), ProgramError> {
        let mut ebpf = lock(&self.ebpf);
        let kprobe = extract_kprobe(&mut ebpf, &link.program)?;
        kprobe
            .detach(link.link_id)
            .map_err(|err| ProgramError::ProgramDetachError {
                program: link.program.clone(),
                source: Box::new(err),
            })
    }
}

fn map_data(map: &Map) -> &MapData {
    match map {
        Map::Array(data)
        | Map::BloomFilter(data)
        | Map::CpuMap(data)
        | Map::DevMap(data)
        | Map::DevMapHash(data)
        | Map::HashMap(data)
        | Map::LpmTrie(data)
        | Map::LruHashMap(data)
        | Map::PerCpuArray(data)
        | Map::PerCpuHashMap(data)
        | Map::PerCpuLruHashMap(data)
        | Map::PerfEventArray(data)
        | Map::ProgramArray(data)
        | Map::Queue(data)
        | Map::RingBuf(data)
        | Map::SockHash(data)
        | Map::SockMap(data)
        | Map::Stack(data)
        | Map::StackTraceMap(data)
        | Map::Unsupported(data)
        | Map::XskMap(data) => data,
    }
}

/// Table backend over the maps of the loaded object.
///
/// The maps themselves are created by the loader; declaring a table checks it
/// exists with the declared dimensions, releasing it removes its pin.
pub struct AyaTables {
    ebpf: Arc<Mutex<Ebpf>>,
    pin_path: PathBuf,
}

impl TableBackend for AyaTables {
    fn allocate(&mut self, table: &TableSpec) -> Result<(), TableError> {
        let ebpf = lock(&self.ebpf);
        let map = ebpf.map(table.name()).ok_or_else(|| TableError::Backend {
            table: table.name().to_string(),
            source: format!("no map named {} in the loaded object", table.name()).into(),
        })?;
        let info = map_data(map).info().map_err(|err| TableError::Backend {
            table: table.name().to_string(),
            source: Box::new(err),
        })?;
        table.check_dimensions(info.key_size(), info.value_size(), info.max_entries())
    }

    fn release(&mut self, table: &TableSpec) -> Result<(), TableError> {
        let path = pinned_path(&self.pin_path, table.name());
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("unpinned {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TableError::Backend {
                table: table.name().to_string(),
                source: Box::new(err),
            }),
        }
    }
}
