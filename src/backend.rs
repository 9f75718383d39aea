use std::fmt;

use ndarray::{ArrayD, ArrayViewD};

use crate::config::BackendConfig;
use crate::datastream::{Chunks, Datastream, DatastreamSpec};
use crate::domain::SlabDecomposition;
use crate::error::{DecompError, Result};
use crate::group::{self, ProcessGroup, ROOT};
use crate::logging::{self, RankLogger, Severity};
use crate::memory::{self, MemoryCeiling, MemoryProbe, SystemProbe};

/// Everything one rank needs to stream its share of a dataset through the accelerator.
///
/// Call [`Backend::datastream_setup`] once the dataset is known, then walk [`Backend::iter`].
/// Set-up mutates the backend and must not run concurrently with readers.
pub struct Backend {
    config: BackendConfig,
    group: Box<dyn ProcessGroup>,
    logger: RankLogger,
    memory: MemoryCeiling,
    stream: Option<Datastream>,
}

impl Backend {
    /// Install the logger, join the process group and size the memory budget.
    pub fn new(config: BackendConfig) -> Result<Self> {
        logging::try_init(config.log_level);
        let group = group::connect(config.force_single_process);
        Self::with_parts(config, group, &SystemProbe)
    }

    /// Build from an existing process group and memory probe.
    pub fn with_parts<P: MemoryProbe + ?Sized>(
        config: BackendConfig,
        group: Box<dyn ProcessGroup>,
        probe: &P,
    ) -> Result<Self> {
        let logger = RankLogger::for_group(group.as_ref());
        let memory = memory::memory_ceiling(
            probe,
            config.max_device_memory_bytes()?,
            config.force_host_memory,
        )?;
        logger.info(
            true,
            format!("memory ceiling = {} bytes ({:?})", memory.bytes, memory.source),
        );

        Ok(Self {
            config,
            group,
            logger,
            memory,
            stream: None,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn is_root(&self) -> bool {
        self.group.rank() == ROOT
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    pub fn logger(&self) -> &RankLogger {
        &self.logger
    }

    pub fn memory_ceiling(&self) -> &MemoryCeiling {
        &self.memory
    }

    /// Decompose `spec` across the group and plan this rank's sub-calls.
    ///
    /// Collective: every rank must call this with the same `spec`.
    pub fn datastream_setup(&mut self, spec: &DatastreamSpec) -> Result<&Datastream> {
        let slabs = SlabDecomposition::negotiate(self.group.as_ref(), &spec.shape, spec.axis)?;
        let partition = slabs.partition();
        self.logger
            .info(true, format!("slab sizes = {:?}", slabs.sizes().sizes()));
        self.logger
            .info(true, format!("slab start = {}", partition.start));
        self.logger
            .info(true, format!("slab stop = {}", partition.stop));

        let stream = Datastream::plan(spec, &slabs, self.memory.bytes)?;
        self.logger.info(
            true,
            format!(
                "total memory required = {}",
                stream.total_memory_required()
            ),
        );
        self.logger
            .info(true, format!("sub-calls = {}", stream.num_chunks()));
        self.logger.debug(
            true,
            format!("sub-call sizes = {:?}", stream.chunk_sizes().sizes()),
        );

        Ok(&*self.stream.insert(stream))
    }

    pub fn datastream(&self) -> Result<&Datastream> {
        self.stream.as_ref().ok_or(DecompError::NotConfigured)
    }

    /// This rank's sub-calls, in order.
    pub fn iter(&self) -> Result<Chunks<'_>> {
        Ok(self.datastream()?.iter())
    }

    /// Log from the root rank, or from every rank when `per_task` is set.
    pub fn print2log(&self, severity: Severity, per_task: bool, message: impl fmt::Display) {
        self.logger.log(severity, per_task, message)
    }

    /// Sum every rank's map onto the root rank. Other ranks get `None`.
    pub fn reduce_to_root(&self, local: ArrayViewD<'_, f64>) -> Result<Option<ArrayD<f64>>> {
        self.group.reduce_sum(local, ROOT)
    }

    pub fn barrier(&self) -> Result<()> {
        self.group.barrier()
    }
}
