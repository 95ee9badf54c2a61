use hashbrown::{HashMap, HashSet};
use thiserror::Error;

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions name the axes of parallelism of a device mesh. The hybrid embedding
/// protocol uses two of them: [`MeshDim::data`] for the replicas that process different
/// batches, and [`MeshDim::model`] for the devices that jointly host one replica of every
/// embedding table.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The data-parallel dimension.
    pub fn data() -> Self {
        Self::new("data")
    }

    /// The model-parallel dimension.
    pub fn model() -> Self {
        Self::new("model")
    }

    /// The dimension name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of devices used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of devices, where
/// each dimension is given a unique name. Devices are laid out in row-major order: the last
/// mesh dimension varies fastest.
///
/// For example, a 2D mesh with shape `[2, 4]` and dimensions `["data", "model"]` over ordinals
/// `0..8` places ordinals `0..4` in the first model-parallel group and `4..8` in the second,
/// while `{0, 4}`, `{1, 5}`, ... form the data-parallel groups.
#[derive(Clone, Debug)]
pub struct DeviceMesh<T> {
    /// Physical devices in an n-dimensional logical arrangement
    devices: Vec<T>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh
    dims: HashMap<MeshDim, usize>,
}

/// Represents errors that can occur when constructing or querying a `DeviceMesh`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder<T> {
    /// Physical devices in an n-dimensional logical arrangement.
    devices: Vec<T>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMeshBuilder<T> {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    ///
    /// # Arguments
    /// * `devices` - A vector of devices to be arranged in the mesh.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and must correspond to a unique
    /// index in the shape of the mesh. Validation happens in [`build`](Self::build).
    ///
    /// # Example
    ///
    /// ```rust
    /// use dlrm_distributed::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::data())
    ///     .with_dim(1, MeshDim::model())
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.shape(), &[2, 2]);
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// Fails if a dimension index is out of range or mapped twice, if some mesh dimension is
    /// left unnamed, or if the device count does not match the mesh shape.
    pub fn build(self) -> Result<DeviceMesh<T>, DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}

impl<T> DeviceMesh<T> {
    /// Shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Devices in row-major mesh order.
    pub fn devices(&self) -> &[T] {
        &self.devices
    }

    /// Index of the named dimension in the mesh shape.
    pub fn dim_index(&self, dim: &MeshDim) -> Result<usize, DeviceMeshError> {
        self.dims.get(dim).copied().ok_or_else(|| {
            DeviceMeshError::InvalidDimension(format!("Unknown mesh dimension {:?}", dim.name()))
        })
    }

    /// Size of the mesh along the named dimension.
    pub fn dim_size(&self, dim: &MeshDim) -> Result<usize, DeviceMeshError> {
        Ok(self.shape[self.dim_index(dim)?])
    }

    /// Mesh coordinates of the device stored at the given flat position.
    pub fn coordinates(&self, flat: usize) -> Vec<usize> {
        let mut coords = vec![0; self.shape.len()];
        let mut rest = flat;
        for (axis, &size) in self.shape.iter().enumerate().rev() {
            coords[axis] = rest % size;
            rest /= size;
        }
        coords
    }
}

impl<T: Clone> DeviceMesh<T> {
    /// Groups of devices that differ only along the named dimension.
    ///
    /// Every device appears in exactly one group. Groups are ordered by the flat position of
    /// their first member, and members within a group are ordered by their coordinate along
    /// `dim`.
    pub fn groups_along(&self, dim: &MeshDim) -> Result<Vec<Vec<T>>, DeviceMeshError> {
        let axis = self.dim_index(dim)?;
        let size = self.shape[axis];
        let stride = self.shape[axis + 1..].iter().product::<usize>();

        let groups = (0..self.devices.len())
            .filter(|flat| self.coordinates(*flat)[axis] == 0)
            .map(|first| {
                (0..size)
                    .map(|step| self.devices[first + step * stride].clone())
                    .collect()
            })
            .collect();

        Ok(groups)
    }
}
