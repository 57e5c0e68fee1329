use crate::{
    error::{Iec104ServerError, Iec104ServerResult},
    protocol::frame::{
        asdu::{CommonAddr, InfoObjAddr, TypeID},
        time::Cp56Time2a,
    },
    types::{DataPoint, PointValue, Quality},
};
use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, warn};

type PointTable = BTreeMap<CommonAddr, BTreeMap<InfoObjAddr, DataPoint>>;

/// Exchanged points keyed by common address, then object address.
///
/// Iteration is ascending on both levels, which fixes the order of interrogation replies.
#[derive(Debug, Default)]
pub struct PointRegistry {
    points: RwLock<PointTable>,
}

impl PointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(points: impl IntoIterator<Item = DataPoint>) -> Self {
        let registry = Self::new();
        registry.reload(points);
        registry
    }

    #[inline]
    fn read(&self) -> RwLockReadGuard<'_, PointTable> {
        self.points.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn write(&self) -> RwLockWriteGuard<'_, PointTable> {
        self.points.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every point and loads `points`. The first definition of an address wins.
    pub fn reload(&self, points: impl IntoIterator<Item = DataPoint>) {
        let mut table = PointTable::new();
        for point in points {
            let by_ioa = table.entry(point.ca).or_default();
            if by_ioa.contains_key(&point.ioa) {
                warn!(
                    label = %point.label,
                    ca = point.ca,
                    ioa = point.ioa,
                    "Duplicate point address ignored"
                );
                continue;
            }
            by_ioa.insert(point.ioa, point);
        }
        *self.write() = table;
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_ca(&self, ca: CommonAddr) -> bool {
        self.read().get(&ca).is_some_and(|points| !points.is_empty())
    }

    /// Configured common addresses in ascending order.
    pub fn common_addresses(&self) -> Vec<CommonAddr> {
        self.read()
            .iter()
            .filter(|(_, points)| !points.is_empty())
            .map(|(ca, _)| *ca)
            .collect()
    }

    pub fn lookup(&self, ca: CommonAddr, ioa: InfoObjAddr) -> Option<DataPoint> {
        self.read().get(&ca)?.get(&ioa).cloned()
    }

    /// Like [`lookup`](Self::lookup) but only returns a point whose direction and kind
    /// match `type_id`.
    pub fn lookup_typed(
        &self,
        ca: CommonAddr,
        ioa: InfoObjAddr,
        type_id: TypeID,
    ) -> Option<DataPoint> {
        self.lookup(ca, ioa).filter(|p| p.accepts(type_id))
    }

    /// Monitoring points of `ca` that belong to interrogation `group`, by ascending IOA.
    pub fn monitoring_points(&self, ca: CommonAddr, group: u8) -> Vec<DataPoint> {
        self.read()
            .get(&ca)
            .map(|points| {
                points
                    .values()
                    .filter(|p| !p.is_command && p.groups.contains(group))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies a south side update and returns the point as stored afterwards.
    ///
    /// A value that does not fit the point kind is dropped while quality and time
    /// are still applied. Updates of time tagged points without a time get the current time.
    pub fn update(
        &self,
        ca: CommonAddr,
        ioa: InfoObjAddr,
        type_id: TypeID,
        value: Option<PointValue>,
        quality: Quality,
        timestamp: Option<Cp56Time2a>,
    ) -> Iec104ServerResult<DataPoint> {
        let mut table = self.write();
        let point = table
            .get_mut(&ca)
            .and_then(|points| points.get_mut(&ioa))
            .filter(|p| p.accepts(type_id))
            .ok_or_else(|| Iec104ServerError::NotFound {
                entity: format!("point {ca}-{ioa} of type {type_id}"),
            })?;

        match value {
            Some(v) if v.kind() == point.kind => point.value = v,
            Some(v) => {
                warn!(
                    label = %point.label,
                    ca,
                    ioa,
                    value = %v,
                    kind = ?point.kind,
                    "Value does not match point type, keeping previous value"
                );
            }
            None => debug!(label = %point.label, ca, ioa, "Update without value"),
        }
        point.quality = quality;
        point.timestamp = if type_id.needs_time() || point.type_id.needs_time() {
            Some(timestamp.unwrap_or_else(Cp56Time2a::now))
        } else {
            timestamp
        };
        Ok(point.clone())
    }
}
