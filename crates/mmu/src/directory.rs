//! The page table tree of one address space.
//!
//! Nodes are kept in an arena keyed by the frame number that backs them, so the
//! tree is walked through handles rather than raw pointers. All range
//! arithmetic happens on the 39 significant bits of a virtual address (the
//! "linear" address); addresses are sign-extended again only when they leave
//! this module.

use alloc::{collections::BTreeMap, vec::Vec};
use core::ops::Range;

use crate::{
    FrameAllocator, FrameNumber, MmuError, PageEntry, PageFlags, PageTable, PhysicalAddress,
    VirtualAddress,
    layout::{self, Granule, LEVELS, PAGE_SIZE, ROOT_LEVEL, VIRTUAL_BITS, level_size},
};

/// The result of a successful walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical address the walked virtual address resolves to.
    pub phys: PhysicalAddress,
    /// Flags of the leaf entry.
    pub flags: PageFlags,
    /// Granule of the leaf entry.
    pub granule: Granule,
}

impl Translation {
    /// Returns the physical base of the leaf that produced this translation.
    pub fn base(&self) -> PhysicalAddress {
        self.phys.align_down(self.granule.size())
    }
}

/// A multi-level page table tree.
pub struct PageDirectory {
    root: FrameNumber,
    nodes: BTreeMap<FrameNumber, PageTable>,
}

impl PageDirectory {
    /// Creates a directory with an empty root node.
    pub fn new(frames: &dyn FrameAllocator) -> Result<Self, MmuError> {
        let root = frames.alloc_frame().ok_or(MmuError::AllocationFailure)?;
        let mut nodes = BTreeMap::new();
        nodes.insert(root, PageTable::new());
        Ok(Self { root, nodes })
    }

    /// Returns the frame backing the root node.
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Returns the number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if `frame` backs one of this directory's nodes.
    pub fn owns_node(&self, frame: FrameNumber) -> bool {
        self.nodes.contains_key(&frame)
    }

    /// Translates `va` by walking the tree from the root.
    ///
    /// At each level the leaf marker is checked before descending, so the first
    /// valid leaf decides both the physical base and the granule.
    pub fn walk(&self, va: VirtualAddress) -> Option<Translation> {
        if !va.is_canonical() {
            return None;
        }
        let linear = to_linear(va);
        let mut node = self.root;
        for level in (0..LEVELS).rev() {
            let entry = self.node(node).entry(va.page_index(level));
            if let Some(base) = entry.address() {
                return Some(Translation {
                    phys: base + (linear & (level_size(level) - 1)),
                    flags: entry.flags(),
                    granule: Granule::from_level(level),
                });
            }
            node = entry.next_table()?;
        }
        None
    }

    /// Installs translations for `[va, va + size)` onto `[pa, pa + size)`.
    ///
    /// Every leaf whose translation changed is pushed to `flushes`, including on
    /// failure, so the caller can shoot down stale TLB entries either way.
    pub fn map(
        &mut self,
        frames: &dyn FrameAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        flags: PageFlags,
        overwrite: bool,
        flushes: &mut Vec<VirtualAddress>,
    ) -> Result<(), MmuError> {
        let range = virtual_range(va, size)?;
        check_physical_range(pa, size)?;

        if !overwrite && self.any_mapped(self.root, ROOT_LEVEL, 0, &range) {
            return Err(MmuError::AlreadyMapped);
        }
        if overwrite {
            self.split_at(frames, range.start, flushes)?;
            self.split_at(frames, range.end, flushes)?;
        }

        let mut installed: Vec<(usize, Granule)> = Vec::new();
        let mut linear = range.start;
        let mut phys = pa.as_usize();
        while linear < range.end {
            let granule = choose_granule(linear, phys, range.end - linear);
            let result = self.install(
                frames,
                linear,
                PhysicalAddress::new(phys),
                granule,
                flags,
                flushes,
            );
            if let Err(err) = result {
                log::debug!(
                    "map of {} ({} bytes) failed after {} leaves: {}",
                    va,
                    size,
                    installed.len(),
                    err
                );
                // Nodes allocated on the failed path are empty; prune them too.
                self.remove_leaf(frames, linear, granule.level(), flushes);
                for &(linear, granule) in installed.iter().rev() {
                    self.remove_leaf(frames, linear, granule.level(), flushes);
                }
                return Err(err);
            }
            installed.push((linear, granule));
            linear += granule.size();
            phys += granule.size();
        }
        Ok(())
    }

    /// Removes the translations for `[va, va + size)`.
    ///
    /// Fails without changing anything if any page in the range is unmapped.
    /// Nodes left without valid entries are freed.
    pub fn unmap(
        &mut self,
        frames: &dyn FrameAllocator,
        va: VirtualAddress,
        size: usize,
        flushes: &mut Vec<VirtualAddress>,
    ) -> Result<(), MmuError> {
        let range = virtual_range(va, size)?;
        if !self.fully_mapped(self.root, ROOT_LEVEL, 0, &range) {
            return Err(MmuError::NotMapped);
        }
        self.split_at(frames, range.start, flushes)?;
        self.split_at(frames, range.end, flushes)?;
        self.clear_range(frames, self.root, ROOT_LEVEL, 0, &range, flushes);
        Ok(())
    }

    /// Replaces the permission bits of every leaf in `[va, va + size)`.
    ///
    /// Accessed and dirty bits of the existing leaves are preserved.
    pub fn protect(
        &mut self,
        frames: &dyn FrameAllocator,
        va: VirtualAddress,
        size: usize,
        flags: PageFlags,
        flushes: &mut Vec<VirtualAddress>,
    ) -> Result<(), MmuError> {
        let range = virtual_range(va, size)?;
        if !self.fully_mapped(self.root, ROOT_LEVEL, 0, &range) {
            return Err(MmuError::NotMapped);
        }
        self.split_at(frames, range.start, flushes)?;
        self.split_at(frames, range.end, flushes)?;
        self.protect_range(self.root, ROOT_LEVEL, 0, &range, flags.permissions(), flushes);
        Ok(())
    }

    /// Frees every node, leaves before parents, and returns how many were freed.
    pub fn destroy(
        mut self,
        frames: &dyn FrameAllocator,
        flushes: &mut Vec<VirtualAddress>,
    ) -> usize {
        let count = self.nodes.len();
        self.free_subtree(frames, self.root, ROOT_LEVEL, 0, flushes);
        count
    }

    fn node(&self, node: FrameNumber) -> &PageTable {
        let Some(table) = self.nodes.get(&node) else {
            unreachable!("page table node {} is not owned by this directory", node)
        };
        table
    }

    fn node_mut(&mut self, node: FrameNumber) -> &mut PageTable {
        let Some(table) = self.nodes.get_mut(&node) else {
            unreachable!("page table node {} is not owned by this directory", node)
        };
        table
    }

    fn alloc_node(&mut self, frames: &dyn FrameAllocator) -> Result<FrameNumber, MmuError> {
        let frame = frames.alloc_frame().ok_or(MmuError::AllocationFailure)?;
        self.nodes.insert(frame, PageTable::new());
        Ok(frame)
    }

    fn release_node(&mut self, frames: &dyn FrameAllocator, node: FrameNumber) {
        self.nodes.remove(&node);
        frames.free_frame(node);
    }

    /// Returns true if any page of `range` inside the subtree has a leaf.
    fn any_mapped(
        &self,
        node: FrameNumber,
        level: usize,
        base: usize,
        range: &Range<usize>,
    ) -> bool {
        let size = level_size(level);
        index_range(level, base, range).any(|index| {
            let entry = self.node(node).entry(index);
            let entry_base = base + index * size;
            match entry.next_table() {
                Some(child) if level > 0 => {
                    self.any_mapped(child, level - 1, entry_base, &clip(range, entry_base, size))
                }
                _ => entry.is_leaf(),
            }
        })
    }

    /// Returns true if every page of `range` inside the subtree has a leaf.
    fn fully_mapped(
        &self,
        node: FrameNumber,
        level: usize,
        base: usize,
        range: &Range<usize>,
    ) -> bool {
        let size = level_size(level);
        index_range(level, base, range).all(|index| {
            let entry = self.node(node).entry(index);
            let entry_base = base + index * size;
            match entry.next_table() {
                Some(child) if level > 0 => {
                    self.fully_mapped(child, level - 1, entry_base, &clip(range, entry_base, size))
                }
                _ => entry.is_leaf(),
            }
        })
    }

    /// Makes sure no superpage leaf straddles `linear`.
    ///
    /// Splitting keeps every translation intact, so a failure here leaves the
    /// address space observably unchanged.
    fn split_at(
        &mut self,
        frames: &dyn FrameAllocator,
        linear: usize,
        flushes: &mut Vec<VirtualAddress>,
    ) -> Result<(), MmuError> {
        if linear >= 1 << VIRTUAL_BITS {
            return Ok(());
        }
        let mut node = self.root;
        for level in (1..LEVELS).rev() {
            let index = layout::page_index(linear, level);
            let entry = self.node(node).entry(index);
            if let Some(child) = entry.next_table() {
                node = child;
            } else if entry.is_leaf() {
                if linear % level_size(level) == 0 {
                    return Ok(());
                }
                node = self.split_leaf(frames, node, index, level, entry, linear, flushes)?;
            } else {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Replaces the superpage leaf at `index` of `node` with a table of leaves
    /// one level down covering the same range, and returns the new node.
    fn split_leaf(
        &mut self,
        frames: &dyn FrameAllocator,
        node: FrameNumber,
        index: usize,
        level: usize,
        leaf: PageEntry,
        linear: usize,
        flushes: &mut Vec<VirtualAddress>,
    ) -> Result<FrameNumber, MmuError> {
        let Some(phys) = leaf.address() else {
            return Err(MmuError::NotMapped);
        };
        let flags = leaf.flags();
        let child = self.alloc_node(frames)?;
        let child_size = level_size(level - 1);
        let table = self.node_mut(child);
        for i in 0..layout::ENTRY_COUNT {
            *table.entry_mut(i) = PageEntry::leaf(phys + i * child_size, flags);
        }
        *self.node_mut(node).entry_mut(index) = PageEntry::table(child);

        let base = linear & !(level_size(level) - 1);
        log::trace!(
            "split {} leaf at {} into {}",
            Granule::from_level(level),
            to_virtual(base),
            Granule::from_level(level - 1)
        );
        flushes.push(to_virtual(base));
        Ok(child)
    }

    /// Installs one leaf of `granule` at `linear`, creating or splitting the
    /// nodes above it as needed and freeing any subtree it replaces.
    fn install(
        &mut self,
        frames: &dyn FrameAllocator,
        linear: usize,
        phys: PhysicalAddress,
        granule: Granule,
        flags: PageFlags,
        flushes: &mut Vec<VirtualAddress>,
    ) -> Result<(), MmuError> {
        let target = granule.level();
        let mut node = self.root;
        for level in (target + 1..LEVELS).rev() {
            let index = layout::page_index(linear, level);
            let entry = self.node(node).entry(index);
            node = if let Some(child) = entry.next_table() {
                child
            } else if entry.is_leaf() {
                self.split_leaf(frames, node, index, level, entry, linear, flushes)?
            } else {
                let child = self.alloc_node(frames)?;
                *self.node_mut(node).entry_mut(index) = PageEntry::table(child);
                child
            };
        }

        let index = layout::page_index(linear, target);
        let old = self.node(node).entry(index);
        match old.next_table() {
            Some(child) if target > 0 => {
                self.free_subtree(frames, child, target - 1, linear, flushes)
            }
            _ if old.is_leaf() => flushes.push(to_virtual(linear)),
            _ => {}
        }
        *self.node_mut(node).entry_mut(index) = PageEntry::leaf(phys, flags);
        log::trace!("mapped {} -> {} ({})", to_virtual(linear), phys, granule);
        Ok(())
    }

    /// Clears the leaf at `linear` on level `target` and frees the nodes left
    /// empty along its path. The path may end above `target`.
    fn remove_leaf(
        &mut self,
        frames: &dyn FrameAllocator,
        linear: usize,
        target: usize,
        flushes: &mut Vec<VirtualAddress>,
    ) {
        let mut path = Vec::with_capacity(LEVELS);
        let mut node = self.root;
        let mut level = ROOT_LEVEL;
        while level > target {
            let index = layout::page_index(linear, level);
            let Some(child) = self.node(node).entry(index).next_table() else {
                break;
            };
            path.push((node, index));
            node = child;
            level -= 1;
        }

        if level == target {
            let entry = self.node_mut(node).entry_mut(layout::page_index(linear, target));
            if entry.is_leaf() {
                entry.clear();
                flushes.push(to_virtual(linear));
            }
        }

        while let Some((parent, index)) = path.pop() {
            if !self.node(node).is_empty() {
                break;
            }
            self.release_node(frames, node);
            self.node_mut(parent).entry_mut(index).clear();
            node = parent;
        }
    }

    fn clear_range(
        &mut self,
        frames: &dyn FrameAllocator,
        node: FrameNumber,
        level: usize,
        base: usize,
        range: &Range<usize>,
        flushes: &mut Vec<VirtualAddress>,
    ) {
        let size = level_size(level);
        for index in index_range(level, base, range) {
            let entry_base = base + index * size;
            let entry = self.node(node).entry(index);
            if entry.is_leaf() {
                self.node_mut(node).entry_mut(index).clear();
                flushes.push(to_virtual(entry_base));
            } else if let Some(child) = entry.next_table().filter(|_| level > 0) {
                let sub = clip(range, entry_base, size);
                self.clear_range(frames, child, level - 1, entry_base, &sub, flushes);
                if self.node(child).is_empty() {
                    self.release_node(frames, child);
                    self.node_mut(node).entry_mut(index).clear();
                }
            }
        }
    }

    fn protect_range(
        &mut self,
        node: FrameNumber,
        level: usize,
        base: usize,
        range: &Range<usize>,
        permissions: PageFlags,
        flushes: &mut Vec<VirtualAddress>,
    ) {
        let size = level_size(level);
        for index in index_range(level, base, range) {
            let entry_base = base + index * size;
            let entry = self.node(node).entry(index);
            if entry.is_leaf() {
                let status = entry.flags() - PageFlags::PERMISSIONS;
                self.node_mut(node)
                    .entry_mut(index)
                    .set_flags(permissions | status);
                flushes.push(to_virtual(entry_base));
            } else if let Some(child) = entry.next_table().filter(|_| level > 0) {
                let sub = clip(range, entry_base, size);
                self.protect_range(child, level - 1, entry_base, &sub, permissions, flushes);
            }
        }
    }

    /// Frees `node` and everything below it, children first. Leaves found on
    /// the way are reported to `flushes`.
    fn free_subtree(
        &mut self,
        frames: &dyn FrameAllocator,
        node: FrameNumber,
        level: usize,
        base: usize,
        flushes: &mut Vec<VirtualAddress>,
    ) {
        let entries: Vec<(usize, PageEntry)> = self.node(node).valid_entries().collect();
        for (index, entry) in entries {
            let entry_base = base + index * level_size(level);
            match entry.next_table() {
                Some(child) if level > 0 => {
                    self.free_subtree(frames, child, level - 1, entry_base, flushes)
                }
                _ => flushes.push(to_virtual(entry_base)),
            }
        }
        self.release_node(frames, node);
    }
}

/// Largest granule whose size fits `remaining` and to which both addresses
/// are aligned.
fn choose_granule(linear: usize, phys: usize, remaining: usize) -> Granule {
    Granule::DESCENDING
        .into_iter()
        .find(|granule| {
            let size = granule.size();
            linear % size == 0 && phys % size == 0 && remaining >= size
        })
        .unwrap_or(Granule::Page4K)
}

/// Validates a virtual range and converts it to linear form.
fn virtual_range(va: VirtualAddress, size: usize) -> Result<Range<usize>, MmuError> {
    if size == 0 || size % PAGE_SIZE != 0 || !va.is_aligned(PAGE_SIZE) {
        return Err(MmuError::Misaligned);
    }
    if !va.is_canonical() {
        return Err(MmuError::OutOfRange);
    }
    let start = to_linear(va);
    let half_end = if start >= 1 << (VIRTUAL_BITS - 1) {
        1 << VIRTUAL_BITS
    } else {
        1 << (VIRTUAL_BITS - 1)
    };
    let end = start
        .checked_add(size)
        .filter(|end| *end <= half_end)
        .ok_or(MmuError::OutOfRange)?;
    Ok(start..end)
}

fn check_physical_range(pa: PhysicalAddress, size: usize) -> Result<(), MmuError> {
    if !pa.is_aligned(PAGE_SIZE) {
        return Err(MmuError::Misaligned);
    }
    pa.as_usize()
        .checked_add(size)
        .filter(|end| *end <= 1 << layout::PHYSICAL_BITS)
        .map(|_| ())
        .ok_or(MmuError::OutOfRange)
}

/// Indices of the entries of a node at `level` based at `base` that overlap `range`.
fn index_range(level: usize, base: usize, range: &Range<usize>) -> Range<usize> {
    let size = level_size(level);
    let first = (range.start - base) / size;
    let last = (range.end - 1 - base) / size;
    first..last + 1
}

fn clip(range: &Range<usize>, base: usize, size: usize) -> Range<usize> {
    range.start.max(base)..range.end.min(base + size)
}

fn to_linear(va: VirtualAddress) -> usize {
    va.as_usize() & layout::VIRTUAL_MASK
}

fn to_virtual(linear: usize) -> VirtualAddress {
    VirtualAddress::new(layout::canonicalize_virtual(linear))
}
