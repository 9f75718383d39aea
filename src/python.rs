//! Python bindings, so the map-making scripts can drive the planner directly.

use ndarray::Ix1;
use numpy::{PyArray1, PyReadonlyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::backend::Backend;
use crate::config::BackendConfig;
use crate::datastream::DatastreamSpec;
use crate::domain::DecompositionKind;
use crate::error::DecompError;
use crate::logging::{LogLevel, Severity};

impl From<DecompError> for PyErr {
    fn from(e: DecompError) -> PyErr {
        PyValueError::new_err(e.to_string())
    }
}

/// The backend holds a process-group handle that must stay on the thread that created it.
#[pyclass(name = "Backend", unsendable)]
struct BackendPy {
    backend: Backend,
}

#[pymethods]
impl BackendPy {
    #[new]
    #[pyo3(signature = (logging_level=1, force_no_mpi=false, force_no_gpu=false, max_gpu_mem_gb=40.0))]
    fn new(
        logging_level: u8,
        force_no_mpi: bool,
        force_no_gpu: bool,
        max_gpu_mem_gb: f64,
    ) -> PyResult<Self> {
        let log_level = LogLevel::try_from(logging_level).map_err(PyValueError::new_err)?;
        let config = BackendConfig::default()
            .with_log_level(log_level)
            .with_single_process(force_no_mpi)
            .with_host_memory(force_no_gpu)
            .with_max_device_memory_gb(max_gpu_mem_gb);
        Ok(Self {
            backend: Backend::new(config)?,
        })
    }

    /// Must be called on every rank with the same arguments before [`BackendPy::get_iterator`].
    #[pyo3(signature = (data_shape, bytes_per_cell, peak_per_cell_memory, overhead_factor, decom_type="slab", divide_axis=0))]
    fn datastream_setup(
        &mut self,
        data_shape: Vec<usize>,
        bytes_per_cell: u64,
        peak_per_cell_memory: u64,
        overhead_factor: f64,
        decom_type: &str,
        divide_axis: usize,
    ) -> PyResult<()> {
        let kind: DecompositionKind = decom_type.parse()?;
        let spec = DatastreamSpec::new(
            data_shape,
            bytes_per_cell,
            peak_per_cell_memory,
            overhead_factor,
        )
        .with_kind(kind)
        .with_axis(divide_axis);
        self.backend.datastream_setup(&spec)?;
        Ok(())
    }

    /// `[(start, stop, byte_offset, shape), ...]` for this rank.
    fn get_iterator(&self) -> PyResult<Vec<(usize, usize, u64, Vec<usize>)>> {
        Ok(self
            .backend
            .iter()?
            .map(|c| (c.start, c.stop, c.byte_offset, c.shape))
            .collect())
    }

    #[pyo3(signature = (message, level="info", per_task=false))]
    fn print2log(&self, message: &str, level: &str, per_task: bool) -> PyResult<()> {
        let severity: Severity = level.parse().map_err(PyValueError::new_err)?;
        self.backend.print2log(severity, per_task, message);
        Ok(())
    }

    /// Sum a map over all ranks. Returns the total on the root rank and `None` elsewhere.
    fn reduce2map<'py>(
        &self,
        py: Python<'py>,
        map: PyReadonlyArray1<'py, f64>,
    ) -> PyResult<Option<Bound<'py, PyArray1<f64>>>> {
        let total = self.backend.reduce_to_root(map.as_array().into_dyn())?;
        total
            .map(|t| {
                t.into_dimensionality::<Ix1>()
                    .map(|t| PyArray1::from_owned_array(py, t))
                    .map_err(|e| PyValueError::new_err(e.to_string()))
            })
            .transpose()
    }

    #[getter]
    fn rank(&self) -> usize {
        self.backend.rank()
    }

    #[getter]
    fn size(&self) -> usize {
        self.backend.size()
    }

    #[getter]
    fn is_root(&self) -> bool {
        self.backend.is_root()
    }
}

/// Slab decomposition and chunk planning for sky-map pipelines.
#[pymodule]
fn skyslab(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<BackendPy>()?;
    Ok(())
}
