use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Resource name used for accelerator devices
pub const ACCELERATOR_RESOURCE: &str = "nvidia.com/gpu";

/// Resource name used for local storage
pub const STORAGE_RESOURCE: &str = "ephemeral-storage";

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// A schedulable resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Cpu,
    Memory,
    Storage,
    Accelerator,
}

impl Dimension {
    /// All dimensions, in the order they are checked
    pub const ALL: [Dimension; 4] = [
        Dimension::Cpu,
        Dimension::Memory,
        Dimension::Storage,
        Dimension::Accelerator,
    ];

    /// Kubernetes resource name of this dimension
    pub fn resource_name(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Storage => STORAGE_RESOURCE,
            Dimension::Accelerator => ACCELERATOR_RESOURCE,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Cpu => "CPU",
            Dimension::Memory => "memory",
            Dimension::Storage => "storage",
            Dimension::Accelerator => "accelerator",
        };
        write!(f, "{}", name)
    }
}

/// Resource quantities for nodes and pods
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    /// CPU in millicores (1000 = 1 core)
    pub cpu_millicores: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
    /// Local storage in bytes
    pub storage_bytes: i64,
    /// Accelerator device count
    pub accelerators: i64,
}

impl ResourceQuantities {
    /// Create quantities for CPU and memory only
    pub fn new(cpu_millicores: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
            ..Default::default()
        }
    }

    /// Parse a Kubernetes quantity into base units (e.g. "1.5Gi", "100m", "2k", "1e3")
    pub fn parse_scalar(s: &str) -> Result<f64, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty quantity".to_string());
        }

        for (suffix, factor) in BINARY_SUFFIXES {
            if let Some(num) = s.strip_suffix(suffix) {
                return parse_number(num).map(|n| n * factor);
            }
        }

        for (suffix, factor) in DECIMAL_SUFFIXES {
            if let Some(num) = s.strip_suffix(suffix) {
                return parse_number(num).map(|n| n * factor);
            }
        }

        parse_number(s)
    }

    /// Parse CPU string (e.g., "2", "1000m", "0.5")
    pub fn parse_cpu(s: &str) -> Result<i64, String> {
        if let Some(m) = s.strip_suffix('m') {
            // Millicores
            m.parse::<i64>()
                .map_err(|e| format!("Invalid CPU millicore value: {}", e))
                .and_then(non_negative)
        } else {
            Self::parse_scalar(s)
                .map(|cores| (cores * 1000.0).round() as i64)
                .map_err(|e| format!("Invalid CPU format '{}': {}", s, e))
        }
    }

    /// Parse memory or storage string (e.g., "128Mi", "1Gi", "1024", "1G")
    pub fn parse_memory(s: &str) -> Result<i64, String> {
        Self::parse_scalar(s)
            .map(|bytes| bytes.round() as i64)
            .map_err(|e| format!("Invalid memory format '{}': {}", s, e))
    }

    /// Parse a plain count (e.g., accelerators, pods)
    pub fn parse_count(s: &str) -> Result<i64, String> {
        Self::parse_scalar(s)
            .map(|n| n.round() as i64)
            .map_err(|e| format!("Invalid count '{}': {}", s, e))
    }

    /// Get quantities from a resource map (k8s-openapi format), ignoring
    /// unparseable values
    pub fn from_k8s_resource_map(resources: &BTreeMap<String, Quantity>) -> Self {
        let get = |key: &str, parse: fn(&str) -> Result<i64, String>| {
            resources
                .get(key)
                .and_then(|q| parse(&q.0).ok())
                .unwrap_or(0)
        };

        Self {
            cpu_millicores: get("cpu", Self::parse_cpu),
            memory_bytes: get("memory", Self::parse_memory),
            storage_bytes: get(STORAGE_RESOURCE, Self::parse_memory),
            accelerators: get(ACCELERATOR_RESOURCE, Self::parse_count),
        }
    }

    /// Get quantities from a resource map, failing on the first malformed value
    pub fn try_from_k8s_resource_map(
        resources: &BTreeMap<String, Quantity>,
    ) -> Result<Self, String> {
        let mut result = Self::default();

        for dimension in Dimension::ALL {
            let Some(quantity) = resources.get(dimension.resource_name()) else {
                continue;
            };
            let value = match dimension {
                Dimension::Cpu => Self::parse_cpu(&quantity.0),
                Dimension::Memory | Dimension::Storage => Self::parse_memory(&quantity.0),
                Dimension::Accelerator => Self::parse_count(&quantity.0),
            }?;
            result.set(dimension, value);
        }

        Ok(result)
    }

    /// Value of a single dimension
    pub fn get(&self, dimension: Dimension) -> i64 {
        match dimension {
            Dimension::Cpu => self.cpu_millicores,
            Dimension::Memory => self.memory_bytes,
            Dimension::Storage => self.storage_bytes,
            Dimension::Accelerator => self.accelerators,
        }
    }

    /// Set a single dimension
    pub fn set(&mut self, dimension: Dimension, value: i64) {
        match dimension {
            Dimension::Cpu => self.cpu_millicores = value,
            Dimension::Memory => self.memory_bytes = value,
            Dimension::Storage => self.storage_bytes = value,
            Dimension::Accelerator => self.accelerators = value,
        }
    }

    /// Add per dimension, `None` if any dimension overflows
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        let mut result = Self::default();
        for dimension in Dimension::ALL {
            result.set(dimension, self.get(dimension).checked_add(other.get(dimension))?);
        }
        Some(result)
    }

    /// Subtract per dimension, clamping at zero
    pub fn saturating_sub(&self, other: &Self) -> Self {
        let mut result = Self::default();
        for dimension in Dimension::ALL {
            result.set(
                dimension,
                self.get(dimension).saturating_sub(other.get(dimension)).max(0),
            );
        }
        result
    }

    /// What is still missing for `self` to fit into `free`
    pub fn deficit(&self, free: &Self) -> Self {
        self.saturating_sub(free)
    }

    /// First dimension in which `self` exceeds `capacity`
    pub fn exceeds(&self, capacity: &Self) -> Option<Dimension> {
        Dimension::ALL
            .into_iter()
            .find(|d| self.get(*d) > capacity.get(*d))
    }

    /// Whether `self` fits within `capacity` in every dimension
    pub fn fits_within(&self, capacity: &Self) -> bool {
        self.exceeds(capacity).is_none()
    }

    /// Whether every dimension is zero
    pub fn is_zero(&self) -> bool {
        Dimension::ALL.into_iter().all(|d| self.get(d) == 0)
    }
}

/// Saturates at `i64::MAX`; use `checked_add` to detect overflow
impl Add for ResourceQuantities {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_add(rhs.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_add(rhs.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_add(rhs.storage_bytes),
            accelerators: self.accelerators.saturating_add(rhs.accelerators),
        }
    }
}

impl AddAssign for ResourceQuantities {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceQuantities {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_sub(rhs.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_sub(rhs.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_sub(rhs.storage_bytes),
            accelerators: self.accelerators.saturating_sub(rhs.accelerators),
        }
    }
}

impl std::iter::Sum for ResourceQuantities {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, q| acc + q)
    }
}

impl fmt::Display for ResourceQuantities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m memory={}B storage={}B accelerators={}",
            self.cpu_millicores, self.memory_bytes, self.storage_bytes, self.accelerators
        )
    }
}

/// Fraction of `capacity` taken by `used`; a missing capacity counts as full
pub fn utilization(used: i64, capacity: i64) -> f64 {
    if capacity <= 0 {
        return 1.0;
    }
    used as f64 / capacity as f64
}

fn parse_number(num: &str) -> Result<f64, String> {
    let value = num
        .parse::<f64>()
        .map_err(|e| format!("Invalid number '{}': {}", num, e))?;

    if !value.is_finite() {
        return Err(format!("Quantity is not finite: {}", num));
    }
    if value < 0.0 {
        return Err(format!("Quantity must not be negative: {}", num));
    }

    Ok(value)
}

fn non_negative(value: i64) -> Result<i64, String> {
    if value < 0 {
        Err(format!("Quantity must not be negative: {}", value))
    } else {
        Ok(value)
    }
}
