//! Archetype storage.
//!
//! An [`Archetype`] stores all entities sharing one component mask, laid
//! out column-major: one [`Column`] of contiguous payloads per component,
//! plus a parallel entity vector. Rows are kept dense with
//! swap-with-last removal.
//!
//! # Safety
//!
//! Component payloads are raw bytes, so columns are manually managed
//! allocations. All `unsafe` in the crate is confined to this module and
//! the scheduler; the invariants are:
//!
//! - A column's buffer holds `len` initialized rows of `stride` bytes,
//!   aligned to the component's declared alignment.
//! - Row indices handed to accessors are bounds-checked (`assert!`) before
//!   any pointer arithmetic.
//! - The raw column pointers exported to the scheduler are only
//!   dereferenced by tasks whose conflict analysis guarantees exclusive
//!   access to written columns.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs.

use std::alloc::{self, Layout};
use std::ptr;

use crate::component::{ComponentIndex, ComponentRegistry};
use crate::entity::Entity;
use crate::mask::ComponentMask;

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A densely packed buffer of fixed-stride component payloads.
pub(crate) struct Column {
    /// Heap allocation; null while capacity == 0 and for zero-stride
    /// (tag) components.
    data: *mut u8,
    len: usize,
    capacity: usize,
    stride: usize,
    align: usize,
}

// The buffer holds plain bytes; ownership and aliasing are managed by the
// archetype and the scheduler's conflict analysis.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    pub fn new(stride: usize, align: usize) -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            stride,
            align: align.max(1),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    fn layout_for(&self, capacity: usize) -> Option<Layout> {
        if self.stride == 0 || capacity == 0 {
            return None;
        }
        Layout::from_size_align(self.stride * capacity, self.align).ok()
    }

    fn grow_if_needed(&mut self) {
        if self.len < self.capacity {
            return;
        }
        let new_capacity = if self.capacity == 0 {
            8
        } else {
            self.capacity * 2
        };
        if self.stride == 0 {
            self.capacity = new_capacity;
            return;
        }
        let new_layout = self
            .layout_for(new_capacity)
            .expect("column layout overflow");
        unsafe {
            let new_data = if self.capacity == 0 {
                alloc::alloc(new_layout)
            } else {
                let old_layout = self.layout_for(self.capacity).expect("old layout valid");
                alloc::realloc(self.data, old_layout, new_layout.size())
            };
            assert!(!new_data.is_null(), "column allocation failed");
            self.data = new_data;
        }
        self.capacity = new_capacity;
    }

    #[inline]
    fn ptr_at(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.len);
        unsafe { self.data.add(row * self.stride) }
    }

    /// Append a row initialized from `init` (zeroed when `None`).
    pub fn push_row(&mut self, init: Option<&[u8]>) {
        self.grow_if_needed();
        if self.stride > 0 {
            unsafe {
                let dst = self.data.add(self.len * self.stride);
                match init {
                    Some(bytes) => {
                        debug_assert_eq!(bytes.len(), self.stride);
                        ptr::copy_nonoverlapping(bytes.as_ptr(), dst, self.stride);
                    }
                    None => ptr::write_bytes(dst, 0, self.stride),
                }
            }
        }
        self.len += 1;
    }

    /// The payload of `row`.
    pub fn row(&self, row: usize) -> &[u8] {
        assert!(row < self.len, "row out of range");
        if self.stride == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr_at(row), self.stride) }
    }

    /// The payload of `row`, mutably.
    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        assert!(row < self.len, "row out of range");
        if self.stride == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr_at(row), self.stride) }
    }

    /// Remove `row` by moving the last row into its place.
    pub fn swap_remove(&mut self, row: usize) {
        assert!(row < self.len, "row out of range");
        let last = self.len - 1;
        if self.stride > 0 && row != last {
            unsafe {
                let src = self.ptr_at(last);
                let dst = self.data.add(row * self.stride);
                ptr::copy_nonoverlapping(src, dst, self.stride);
            }
        }
        self.len -= 1;
    }

    /// Raw base pointer for scheduled engine access.
    ///
    /// # Safety
    ///
    /// The caller must not create aliasing accesses: only tasks granted the
    /// column by the scheduler's conflict analysis may read or write
    /// through the pointer, and only rows `< len`.
    pub unsafe fn base_ptr(&self) -> *mut u8 {
        self.data
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if let Some(layout) = self.layout_for(self.capacity) {
            unsafe {
                alloc::dealloc(self.data, layout);
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("stride", &self.stride)
            .field("align", &self.align)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All entities sharing one component mask, stored column-major.
#[derive(Debug)]
pub struct Archetype {
    mask: ComponentMask,
    /// Ascending component indices; `columns[i]` stores `components[i]`.
    components: Vec<ComponentIndex>,
    columns: Vec<Column>,
    entities: Vec<Entity>,
}

impl Archetype {
    pub(crate) fn new(mask: ComponentMask, registry: &ComponentRegistry) -> Self {
        let components: Vec<ComponentIndex> = mask.iter().collect();
        let columns = components
            .iter()
            .map(|&c| {
                let desc = registry.get(c).expect("mask bits are registered");
                Column::new(desc.bytes, desc.align)
            })
            .collect();
        Self {
            mask,
            components,
            columns,
            entities: Vec::new(),
        }
    }

    /// The defining component mask.
    #[inline]
    pub fn mask(&self) -> &ComponentMask {
        &self.mask
    }

    /// Ascending component indices present in this archetype.
    #[inline]
    pub fn components(&self) -> &[ComponentIndex] {
        &self.components
    }

    /// Row-ordered entity ids.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the archetype has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub(crate) fn column_position(&self, c: ComponentIndex) -> Option<usize> {
        self.components.binary_search(&c).ok()
    }

    /// Whether the component is present.
    pub fn has_component(&self, c: ComponentIndex) -> bool {
        self.column_position(c).is_some()
    }

    /// Append a row for `entity`, initializing each column from the
    /// component's default data. Returns the row index.
    pub(crate) fn push_row(&mut self, entity: Entity, registry: &ComponentRegistry) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for (position, &c) in self.components.iter().enumerate() {
            let default = registry
                .get(c)
                .and_then(|desc| desc.default_data.as_deref());
            self.columns[position].push_row(default);
        }
        row
    }

    /// Remove `row` with swap-with-last. Returns the entity that moved
    /// into `row`, if any.
    pub(crate) fn swap_remove_row(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// The payload of component `c` at `row`.
    pub(crate) fn component_data(&self, c: ComponentIndex, row: usize) -> Option<&[u8]> {
        let position = self.column_position(c)?;
        Some(self.columns[position].row(row))
    }

    /// The payload of component `c` at `row`, mutably.
    pub(crate) fn component_data_mut(
        &mut self,
        c: ComponentIndex,
        row: usize,
    ) -> Option<&mut [u8]> {
        let position = self.column_position(c)?;
        Some(self.columns[position].row_mut(row))
    }

    /// Base pointer and stride of component `c`'s column, for the
    /// scheduler.
    ///
    /// # Safety
    ///
    /// See [`Column::base_ptr`].
    pub(crate) unsafe fn column_raw(&self, c: ComponentIndex) -> Option<(*mut u8, usize)> {
        let position = self.column_position(c)?;
        let column = &self.columns[position];
        Some((column.base_ptr(), column.stride()))
    }
}

/// Move `src_row` from `src` to `dst`: common components copy byte-wise,
/// components new in `dst` take their default data. Returns the new row in
/// `dst` and the entity swapped into `src_row`, if any.
pub(crate) fn transfer_row(
    src: &mut Archetype,
    dst: &mut Archetype,
    src_row: usize,
    registry: &ComponentRegistry,
) -> (usize, Option<Entity>) {
    let entity = src.entities[src_row];
    let dst_row = dst.entities.len();
    dst.entities.push(entity);
    for (position, &c) in dst.components.iter().enumerate() {
        match src.column_position(c) {
            Some(src_position) => {
                let bytes = src.columns[src_position].row(src_row);
                dst.columns[position].push_row(Some(bytes));
            }
            None => {
                let default = registry
                    .get(c)
                    .and_then(|desc| desc.default_data.as_deref());
                dst.columns[position].push_row(default);
            }
        }
    }
    let moved = src.swap_remove_row(src_row);
    (dst_row, moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDesc;

    fn registry() -> (ComponentRegistry, ComponentIndex, ComponentIndex, ComponentIndex) {
        let mut reg = ComponentRegistry::new();
        let a = reg.register(ComponentDesc::new("a", 8).with_default_data(vec![7; 8]));
        let b = reg.register(ComponentDesc::new("b", 4));
        let tag = reg.register(ComponentDesc::new("tag", 0));
        (reg, a, b, tag)
    }

    #[test]
    fn push_rows_and_read_back() {
        let (reg, a, b, _tag) = registry();
        let mask = ComponentMask::from_components(&[a, b]);
        let mut arch = Archetype::new(mask, &reg);

        let e = Entity::new(1, 0);
        let row = arch.push_row(e, &reg);
        assert_eq!(row, 0);
        assert_eq!(arch.len(), 1);
        // Default data for a, zeroed for b.
        assert_eq!(arch.component_data(a, 0).unwrap(), &[7; 8]);
        assert_eq!(arch.component_data(b, 0).unwrap(), &[0; 4]);
    }

    #[test]
    fn swap_remove_keeps_columns_dense() {
        let (reg, a, _b, _tag) = registry();
        let mask = ComponentMask::from_components(&[a]);
        let mut arch = Archetype::new(mask, &reg);

        let e0 = Entity::new(1, 0);
        let e1 = Entity::new(2, 0);
        arch.push_row(e0, &reg);
        arch.push_row(e1, &reg);
        arch.component_data_mut(a, 1).unwrap().fill(9);

        let moved = arch.swap_remove_row(0);
        assert_eq!(moved, Some(e1));
        assert_eq!(arch.len(), 1);
        assert_eq!(arch.component_data(a, 0).unwrap(), &[9; 8]);
    }

    #[test]
    fn transfer_copies_common_and_defaults_new() {
        let (reg, a, b, _tag) = registry();
        let mut src = Archetype::new(ComponentMask::from_components(&[a]), &reg);
        let mut dst = Archetype::new(ComponentMask::from_components(&[a, b]), &reg);

        let e = Entity::new(1, 0);
        src.push_row(e, &reg);
        src.component_data_mut(a, 0).unwrap().fill(3);

        let (dst_row, moved) = transfer_row(&mut src, &mut dst, 0, &reg);
        assert_eq!(dst_row, 0);
        assert_eq!(moved, None);
        assert!(src.is_empty());
        assert_eq!(dst.component_data(a, 0).unwrap(), &[3; 8]);
        assert_eq!(dst.component_data(b, 0).unwrap(), &[0; 4]);
        assert_eq!(dst.entities(), &[e]);
    }

    #[test]
    fn tag_components_occupy_no_storage() {
        let (reg, _a, _b, tag) = registry();
        let mut arch = Archetype::new(ComponentMask::from_components(&[tag]), &reg);
        let e = Entity::new(1, 0);
        arch.push_row(e, &reg);
        assert_eq!(arch.component_data(tag, 0).unwrap(), &[] as &[u8]);
    }
}
