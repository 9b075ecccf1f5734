//! Component storage - type-erased column storage for archetype tables.
//!
//! Each column stores components of a single type in a contiguous array,
//! enabling cache-friendly iteration. Slots are constructed, moved and
//! destroyed through the column's [`TypeInfo`] hooks.

use std::{alloc::Layout, ptr::NonNull, sync::Arc};

use crate::component::TypeInfo;

/// A column of components of a single type.
///
/// Stores components in a contiguous, type-erased array.
/// Manages its own memory allocation and deallocation.
pub struct Column {
    /// Pointer to the data array.
    data: NonNull<u8>,
    /// Number of components stored.
    len: usize,
    /// Allocated capacity (in number of components).
    capacity: usize,
    /// Component type information.
    info: Arc<TypeInfo>,
}

// SAFETY: Column manages its own memory and only stores component types,
// which are Send + Sync (Rust types) or plain bytes (raw types)
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Create a new empty column for the given component type.
    #[must_use]
    pub fn new(info: Arc<TypeInfo>) -> Self {
        Self {
            data: aligned_dangling(&info),
            len: 0,
            capacity: 0,
            info,
        }
    }

    /// Get the number of components stored.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the column is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the component info.
    #[must_use]
    pub fn info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    /// Append a default-constructed value.
    pub fn push_default(&mut self) {
        self.reserve(1);
        // SAFETY: We just reserved space, so the slot at len is allocated
        unsafe {
            let dst = self.slot(self.len);
            self.info.construct(dst);
        }
        self.len += 1;
    }

    /// Append a value moved out of `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to an initialized value of the column's type. It is
    /// uninitialized afterwards.
    pub unsafe fn push_move(&mut self, src: *mut u8) {
        self.reserve(1);
        // SAFETY: slot at len is allocated; caller guarantees src
        unsafe {
            let dst = self.slot(self.len);
            self.info.move_to(dst, src);
        }
        self.len += 1;
    }

    /// Move the value at `row` to the end of `dst`, then fill the gap with
    /// the last value of this column.
    ///
    /// # Safety
    ///
    /// `row` must be less than `len` and `dst` must store the same type.
    pub unsafe fn move_row_into(&mut self, row: usize, dst: &mut Column) {
        debug_assert!(row < self.len, "Index out of bounds in move_row_into");
        debug_assert!(Arc::ptr_eq(&self.info, &dst.info) || self.info.layout() == dst.info.layout());
        unsafe {
            let src = self.slot(row);
            dst.push_move(src);
            self.fill_gap(row);
        }
    }

    /// Remove and drop the component at the given index.
    /// Swaps with the last element for O(1) removal.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    pub unsafe fn swap_remove_drop(&mut self, index: usize) {
        debug_assert!(index < self.len, "Index out of bounds in swap_remove_drop");
        unsafe {
            let ptr = self.slot(index);
            self.info.destruct(ptr);
            self.fill_gap(index);
        }
    }

    /// Move the last value into the (uninitialized) slot at `index` and
    /// shrink by one.
    unsafe fn fill_gap(&mut self, index: usize) {
        self.len -= 1;
        if index < self.len {
            // SAFETY: index and len are distinct valid slots
            unsafe {
                let last = self.slot(self.len);
                let hole = self.slot(index);
                self.info.move_to(hole, last);
            }
        }
    }

    /// Raw pointer to an allocated slot.
    unsafe fn slot(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity);
        unsafe { self.data.as_ptr().add(index * self.info.size()) }
    }

    /// Get a raw pointer to the component at the given index.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    #[must_use]
    pub unsafe fn get_unchecked_raw(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        unsafe { self.slot(index) }
    }

    /// Pointer to the component at `index`, if in bounds.
    #[must_use]
    pub fn get_raw(&self, index: usize) -> Option<*mut u8> {
        // SAFETY: bounds checked
        (index < self.len).then(|| unsafe { self.slot(index) })
    }

    /// View the column as a typed slice.
    ///
    /// # Safety
    ///
    /// `T` must match the column's component type.
    #[must_use]
    pub unsafe fn as_slice<T: 'static>(&self) -> &[T] {
        debug_assert!(self.info.is::<T>(), "Type mismatch in Column::as_slice");
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast::<T>(), self.len) }
    }

    /// Get a pointer to the start of the data array.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Reserve capacity for at least `additional` more components.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.len.saturating_add(additional);
        if required <= self.capacity {
            return;
        }
        self.grow(required);
    }

    /// Grow the column to at least `min_capacity`.
    fn grow(&mut self, min_capacity: usize) {
        // Growth strategy: double capacity, but at least 4 elements
        let new_capacity = self
            .capacity
            .saturating_mul(2)
            .max(min_capacity)
            .max(4);

        if self.info.size() == 0 {
            // Zero-sized types don't need allocation
            self.capacity = usize::MAX;
            return;
        }

        let new_layout = array_layout(&self.info, new_capacity);

        // SAFETY: We handle both new allocation and reallocation
        let new_data = unsafe {
            if self.capacity == 0 {
                std::alloc::alloc(new_layout)
            } else {
                let old_layout = array_layout(&self.info, self.capacity);
                std::alloc::realloc(self.data.as_ptr(), old_layout, new_layout.size())
            }
        };

        let Some(new_data) = NonNull::new(new_data) else {
            std::alloc::handle_alloc_error(new_layout);
        };
        self.data = new_data;
        self.capacity = new_capacity;
    }

    /// Clear all components, dropping them.
    pub fn clear(&mut self) {
        if self.info.hooks().dtor.is_some() {
            for i in 0..self.len {
                // SAFETY: i is a valid initialized slot
                unsafe { self.info.destruct(self.slot(i)) };
            }
        }
        self.len = 0;
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        // Drop all components
        self.clear();

        // Deallocate memory
        if self.capacity > 0 && self.info.size() > 0 {
            let layout = array_layout(&self.info, self.capacity);
            // SAFETY: data was allocated with this layout
            unsafe {
                std::alloc::dealloc(self.data.as_ptr(), layout);
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("type", &self.info.name())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn aligned_dangling(info: &TypeInfo) -> NonNull<u8> {
    // An address equal to the alignment is non-null and suitably aligned.
    NonNull::new(info.align() as *mut u8).unwrap_or(NonNull::dangling())
}

/// Calculate the array layout for `count` components.
fn array_layout(info: &TypeInfo, count: usize) -> Layout {
    let layout = info
        .size()
        .checked_mul(count)
        .and_then(|size| Layout::from_size_align(size, info.align()).ok());
    match layout {
        Some(layout) => layout,
        None => crate::error::fatal!("column layout overflow for {}", info.name()),
    }
}

/// Growable bitset with swap-remove, one bit per table row.
///
/// Used for toggle columns: a set bit means the component is enabled.
#[derive(Clone, Debug, Default)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
        self.set(self.len - 1, value);
    }

    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len);
        let word = &mut self.words[index / 64];
        if value {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    /// Remove the bit at `index`, moving the last bit into its place.
    /// Returns the removed bit.
    pub fn swap_remove(&mut self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let removed = self.get(index);
        let last = self.get(self.len - 1);
        self.set(index, last);
        self.len -= 1;
        if self.len % 64 == 0 {
            self.words.pop();
        }
        removed
    }

    /// Number of set bits in `start..end`.
    #[must_use]
    pub fn count_ones(&self, start: usize, end: usize) -> usize {
        (start..end.min(self.len)).filter(|&i| self.get(i)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Name(String);

    fn column<T: crate::Component>() -> Column {
        Column::new(Arc::new(TypeInfo::of::<T>()))
    }

    fn push<T: crate::Component>(col: &mut Column, value: T) {
        let mut value = std::mem::ManuallyDrop::new(value);
        unsafe { col.push_move(std::ptr::from_mut(&mut *value).cast()) };
    }

    #[test]
    fn test_column_push_get() {
        let mut col = column::<Position>();

        push(&mut col, Position { x: 1.0, y: 2.0 });
        push(&mut col, Position { x: 3.0, y: 4.0 });
        col.push_default();

        assert_eq!(col.len(), 3);
        // SAFETY: correct type
        let slice = unsafe { col.as_slice::<Position>() };
        assert_eq!(slice[0], Position { x: 1.0, y: 2.0 });
        assert_eq!(slice[1], Position { x: 3.0, y: 4.0 });
        assert_eq!(slice[2], Position::default());
    }

    #[test]
    fn test_column_swap_remove() {
        let mut col = column::<Position>();

        push(&mut col, Position { x: 1.0, y: 2.0 });
        push(&mut col, Position { x: 3.0, y: 4.0 });
        push(&mut col, Position { x: 5.0, y: 6.0 });

        // SAFETY: Index 0 is valid
        unsafe { col.swap_remove_drop(0) };

        assert_eq!(col.len(), 2);
        let slice = unsafe { col.as_slice::<Position>() };
        // Element from index 2 is now at index 0
        assert_eq!(slice[0], Position { x: 5.0, y: 6.0 });
        assert_eq!(slice[1], Position { x: 3.0, y: 4.0 });
    }

    #[test]
    fn test_move_row_between_columns() {
        let mut src = column::<Name>();
        let mut dst = column::<Name>();
        push(&mut src, Name("a".into()));
        push(&mut src, Name("b".into()));
        push(&mut src, Name("c".into()));

        unsafe { src.move_row_into(0, &mut dst) };

        let src_names = unsafe { src.as_slice::<Name>() };
        let dst_names = unsafe { dst.as_slice::<Name>() };
        assert_eq!(src_names, &[Name("c".into()), Name("b".into())]);
        assert_eq!(dst_names, &[Name("a".into())]);
    }

    #[test]
    fn test_column_with_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default, Clone)]
        struct DropCounter;

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut col = column::<DropCounter>();
            col.push_default();
            col.push_default();
            col.push_default();
            unsafe { col.swap_remove_drop(1) };
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 1);
        }

        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_bitset_swap_remove() {
        let mut bits = BitSet::new();
        for i in 0..70 {
            bits.push(i % 2 == 0);
        }
        assert_eq!(bits.len(), 70);
        assert!(bits.get(68));
        assert!(!bits.get(69));

        // last bit (69, false) moves into slot 0
        assert!(bits.swap_remove(0));
        assert!(!bits.get(0));
        assert_eq!(bits.len(), 69);
        assert_eq!(bits.count_ones(0, 69), 34);
    }
}
