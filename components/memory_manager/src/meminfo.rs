//! Allocator accounting exposed to scripts through `meminfo()`.

use crate::heap::Heap;
use crate::object::ObjectKind;

/// One per-category accounting row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationCategory {
    /// Category name: "string", "object", "function" or "native".
    pub type_name: &'static str,
    /// Live allocations in the category.
    pub count: u32,
    /// Approximate bytes held by the category.
    pub size: u32,
}

/// Snapshot of the heap's accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Free slots currently available for reuse, in approximate bytes.
    pub free_size: u32,
    /// Approximate bytes held by live allocations.
    pub allocated_size: u32,
    /// Count of live allocations across both stores.
    pub num_allocations: u32,
    /// Per-category breakdown.
    pub allocations_by_type: Vec<AllocationCategory>,
}

impl Heap {
    /// Takes an accounting snapshot.
    pub fn memory_info(&self) -> MemoryInfo {
        let mut string_count = 0u32;
        let mut string_size = 0u32;
        for (_, s) in self.strings.iter() {
            string_count += 1;
            string_size += s.len() as u32;
        }

        let mut mater = AllocationCategory { type_name: "object", count: 0, size: 0 };
        let mut function = AllocationCategory { type_name: "function", count: 0, size: 0 };
        let mut native = AllocationCategory { type_name: "native", count: 0, size: 0 };
        for (_, o) in self.objects.iter() {
            let bucket = match o.kind() {
                ObjectKind::Mater => &mut mater,
                ObjectKind::Function(_) => &mut function,
                ObjectKind::Native(_) => &mut native,
            };
            bucket.count += 1;
            bucket.size += o.approximate_size();
        }

        let strings = AllocationCategory {
            type_name: "string",
            count: string_count,
            size: string_size,
        };
        let allocated_size = strings.size + mater.size + function.size + native.size;
        let num_allocations = strings.count + mater.count + function.count + native.count;
        let free_slots =
            (self.strings.capacity() - self.strings.live_count())
                + (self.objects.capacity() - self.objects.live_count());

        MemoryInfo {
            free_size: free_slots * std::mem::size_of::<usize>() as u32,
            allocated_size,
            num_allocations,
            allocations_by_type: vec![strings, mater, function, native],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use bytecode_system::Function;
    use core_types::Atom;

    #[test]
    fn test_categories_counted() {
        let mut heap = Heap::new();
        let _ = heap.create_string("abc");
        let _ = heap.create_object(Object::mater());
        let _ = heap.create_object(Object::function(Function::new(Atom::EMPTY)));
        let _ = heap.create_object(Object::native(0));

        let info = heap.memory_info();
        let by_name = |n: &str| {
            info.allocations_by_type
                .iter()
                .find(|c| c.type_name == n)
                .map(|c| c.count)
                .unwrap_or(0)
        };

        // Sentinel entries count too: one string, one object.
        assert_eq!(by_name("string"), 2);
        assert_eq!(by_name("object"), 2);
        assert_eq!(by_name("function"), 1);
        assert_eq!(by_name("native"), 1);
        assert_eq!(info.num_allocations, 6);
        assert!(info.allocated_size > 0);
    }

    #[test]
    fn test_free_size_grows_after_collect() {
        let mut heap = Heap::new();
        for i in 0..10 {
            let _ = heap.create_string(&format!("s{}", i));
        }
        let before = heap.memory_info();
        heap.collect(&[]);
        let after = heap.memory_info();
        assert!(after.num_allocations < before.num_allocations);
        assert!(after.free_size > before.free_size);
    }
}
