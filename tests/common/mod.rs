#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use color_eyre::Result;
use serial_fanout::{
    broadcast::SinkFactory,
    endpoint::{EndpointSpec, Numbering},
    error::Error,
    provision::ProvisionPolicy,
    supervisor::{LifecycleState, Plan},
};
use tokio::{
    io::{duplex, AsyncRead, AsyncReadExt, DuplexStream},
    sync::watch,
    time::timeout,
};

/// Hands out in-memory pipes as endpoint sinks.
/// The reading halves are kept so tests can play consumer.
pub struct MemoryFactory {
    buffer: usize,
    create_nodes: bool,
    fail: BTreeSet<u32>,
    readers: Mutex<BTreeMap<u32, DuplexStream>>,
}

impl MemoryFactory {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            create_nodes: false,
            fail: BTreeSet::new(),
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Also create a file at each endpoint path, failing if one is already there.
    pub fn with_nodes(mut self) -> Self {
        self.create_nodes = true;
        self
    }

    /// Refuse to allocate these ids.
    pub fn failing(mut self, ids: &[u32]) -> Self {
        self.fail.extend(ids);
        self
    }

    pub fn take_reader(&self, id: u32) -> DuplexStream {
        self.readers
            .lock()
            .unwrap()
            .remove(&id)
            .unwrap_or_else(|| panic!("No reader for endpoint {id}"))
    }

    pub fn allocated(&self) -> Vec<u32> {
        self.readers.lock().unwrap().keys().copied().collect()
    }
}

impl SinkFactory for MemoryFactory {
    type Sink = DuplexStream;

    fn allocate(&self, endpoint: &EndpointSpec) -> Result<Self::Sink, Error> {
        let refuse = |problem: String| Error::Provision {
            id: endpoint.id,
            path: endpoint.path.clone(),
            problem,
        };

        if self.fail.contains(&endpoint.id) {
            return Err(refuse("refused by test".into()));
        }

        if self.create_nodes {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&endpoint.path)
                .map_err(|e| refuse(e.to_string()))?;
        }

        let (writer, reader) = duplex(self.buffer);
        self.readers.lock().unwrap().insert(endpoint.id, reader);

        Ok(writer)
    }
}

pub fn plan(prefix: &Path) -> Plan {
    Plan {
        prefix: prefix.to_path_buf(),
        numbering: Numbering::ZeroBased,
        policy: ProvisionPolicy::BestEffort,
        queue_depth: 16,
        sweep_stale: true,
        grace: Duration::from_millis(500),
    }
}

/// The `<stem><digits>` entries in the prefix's directory.
pub fn nodes(prefix: &Path) -> Vec<PathBuf> {
    let dir = prefix.parent().unwrap();
    let stem = prefix.file_name().unwrap().to_string_lossy().into_owned();

    let mut nodes: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix(&stem)
                .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect();

    nodes.sort();
    nodes
}

pub async fn read_exactly<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    timeout(Duration::from_secs(5), reader.read_exact(&mut buf)).await??;

    Ok(buf)
}

pub async fn read_all<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf = vec![];
    timeout(Duration::from_secs(5), reader.read_to_end(&mut buf)).await??;

    Ok(buf)
}

pub async fn wait_for_state(
    states: &mut watch::Receiver<LifecycleState>,
    wanted: LifecycleState,
) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while *states.borrow_and_update() != wanted {
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await?;

    Ok(())
}

/// Pseudo terminals are not available in every sandbox.
pub fn ptys_available() -> bool {
    Path::new("/dev/ptmx").exists()
}
