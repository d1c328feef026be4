use crate::page::PageNumber;
use sealdb_core::RowId;
use std::collections::BTreeMap;

/// In-memory ordered map from row id to the page holding the row.
///
/// Derived state: always rebuildable from the table's entry in the
/// metadata document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableIndex {
    entries: BTreeMap<RowId, PageNumber>,
}

impl TableIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_or_overwrite(&mut self, id: RowId, page: PageNumber) {
        self.entries.insert(id, page);
    }

    pub fn get(&self, id: &RowId) -> Option<PageNumber> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &RowId) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns false if `id` was not present.
    pub fn delete(&mut self, id: &RowId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// All ids in ascending order.
    pub fn all_ids(&self) -> Vec<RowId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowId, PageNumber)> + '_ {
        self.entries.iter().map(|(id, page)| (*id, *page))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(RowId, PageNumber)> for TableIndex {
    fn from_iter<I: IntoIterator<Item = (RowId, PageNumber)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u128) -> RowId {
        RowId::from_u128(raw)
    }

    #[test]
    fn test_insert_get_delete() {
        let mut index = TableIndex::new();
        index.insert_or_overwrite(id(5), 10);
        index.insert_or_overwrite(id(1), 11);

        assert_eq!(index.get(&id(5)), Some(10));
        assert_eq!(index.get(&id(1)), Some(11));
        assert_eq!(index.get(&id(2)), None);
        assert_eq!(index.len(), 2);

        assert!(index.delete(&id(5)));
        assert!(!index.delete(&id(5)));
        assert!(!index.contains(&id(5)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let mut index = TableIndex::new();
        index.insert_or_overwrite(id(7), 1);
        index.insert_or_overwrite(id(7), 2);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&id(7)), Some(2));
    }

    #[test]
    fn test_all_ids_ascending() {
        let index: TableIndex = [(id(30), 0), (id(10), 1), (id(20), 2)].into_iter().collect();

        assert_eq!(index.all_ids(), vec![id(10), id(20), id(30)]);
        assert_eq!(
            index.iter().collect::<Vec<_>>(),
            vec![(id(10), 1), (id(20), 2), (id(30), 0)]
        );
    }

    #[test]
    fn test_empty_index() {
        let index = TableIndex::new();
        assert!(index.is_empty());
        assert!(index.all_ids().is_empty());
    }
}
