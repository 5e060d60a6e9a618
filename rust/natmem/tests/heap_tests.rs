use natmem::{
    BackingStore, BufferOptions, CloseSummary, ErrorKind, HeapOptions, HeapRegistry, NativeBuffer,
    StoreKind, Teardown, TeardownOutcome,
};
use natmem_pressure::accountant;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn filled(heap: &HeapRegistry, options: BufferOptions, len: usize) -> NativeBuffer {
    let mut buffer = heap.create_buffer(options, None).unwrap();
    buffer.allocate(len, false).unwrap();
    buffer.write_bytes(0, &pattern(len)).unwrap();
    buffer
}

#[test]
fn test_close_transfers_and_cascades() {
    let heap = HeapRegistry::create(HeapOptions::new(4096)).unwrap();
    let transfer = BufferOptions::heap().with_teardown(Teardown::TransferOut);
    let mut kept = filled(&heap, transfer, 100);
    let mut dropped = filled(&heap, BufferOptions::heap(), 100);
    assert_eq!(kept.backing_store(), BackingStore::CustomHeap);
    assert_eq!(heap.dependent_count(), 2);

    let summary = unsafe { heap.close() }.unwrap();
    assert_eq!(
        summary,
        CloseSummary {
            released: 1,
            transferred: 1,
            lost: 0
        }
    );
    assert!(!heap.is_open());
    assert_eq!(heap.dependent_count(), 0);

    assert_eq!(kept.size(), 100);
    assert_eq!(kept.as_bytes(), &pattern(100)[..]);
    assert_eq!(kept.backing_store(), BackingStore::GeneralHeap);
    assert_eq!(kept.teardown_outcome(), Some(TeardownOutcome::Transferred));
    assert!(kept.heap().is_some_and(HeapRegistry::is_process_heap));
    assert!(kept.validate());
    kept.reallocate(200).unwrap();
    assert_eq!(&kept.as_bytes()[..100], &pattern(100)[..]);
    kept.free().unwrap();
    assert_eq!(kept.size(), 0);
    assert!(!kept.validate());
    assert!(!kept.is_allocated());

    assert_eq!(dropped.size(), 0);
    assert!(dropped.as_bytes().is_empty());
    assert!(!dropped.validate());
    assert_eq!(dropped.teardown_outcome(), Some(TeardownOutcome::Released));
    assert!(dropped.heap().is_none());
    assert!(dropped.get_u8(0).unwrap_err().is_out_of_range());
    let err = dropped.allocate(16, true).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidOperation { .. }));
    dropped.free().unwrap();
}

#[test]
fn test_transfer_out_for_every_kind() {
    let heap = HeapRegistry::create(HeapOptions::default()).unwrap();
    let kinds = [
        StoreKind::Heap,
        StoreKind::Aligned,
        StoreKind::Virtual,
        StoreKind::ComTask,
        StoreKind::NetworkApi,
    ];
    let mut buffers: Vec<_> = kinds
        .iter()
        .map(|&kind| {
            let options = BufferOptions::new(kind)
                .with_teardown(Teardown::TransferOut)
                .with_alignment(128);
            filled(&heap, options, 300)
        })
        .collect();
    let addresses: Vec<_> = buffers.iter().map(NativeBuffer::as_ptr).collect();

    let summary = unsafe { heap.close() }.unwrap();
    assert_eq!(summary.transferred, kinds.len());

    for ((buffer, kind), address) in buffers.iter_mut().zip(kinds).zip(addresses) {
        assert_eq!(&buffer.as_bytes()[..300], &pattern(300)[..], "{kind:?}");
        assert_eq!(buffer.kind(), kind);
        match kind {
            // Memory outside the heap keeps its address.
            StoreKind::Virtual | StoreKind::ComTask | StoreKind::NetworkApi => {
                assert_eq!(buffer.as_ptr(), address)
            }
            StoreKind::Aligned => assert_eq!(buffer.as_ptr() as usize % 128, 0),
            StoreKind::Heap => assert_eq!(buffer.backing_store(), BackingStore::GeneralHeap),
        }
        buffer.push_out(0, 4, Some(b"head")).unwrap();
        assert_eq!(buffer.read_bytes(0, 4).unwrap(), b"head");
        buffer.free().unwrap();
        assert_eq!(buffer.size(), 0, "{kind:?}");
    }
}

#[test]
fn test_cascade_releases_non_heap_memory() {
    let heap = HeapRegistry::create(HeapOptions::default()).unwrap();
    let pages = filled(&heap, BufferOptions::virtual_memory(), 10_000);
    let task = filled(&heap, BufferOptions::com_task(), 64);
    let empty = heap.create_buffer(BufferOptions::aligned(64), None).unwrap();

    let summary = unsafe { heap.close() }.unwrap();
    assert_eq!(summary.released, 3);
    for buffer in [&pages, &task, &empty] {
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.teardown_outcome(), Some(TeardownOutcome::Released));
    }
}

#[test]
fn test_dropped_dependents_are_not_torn_down() {
    let heap = HeapRegistry::create(HeapOptions::new(4096)).unwrap();
    let a = filled(&heap, BufferOptions::heap(), 32);
    let b = filled(&heap, BufferOptions::heap(), 32);
    drop(a);
    assert_eq!(heap.dependent_count(), 1);
    let c = filled(&heap, BufferOptions::heap(), 32);
    assert_eq!(heap.dependent_count(), 2);

    let summary = unsafe { heap.close() }.unwrap();
    assert_eq!(summary.released, 2);
    drop(b);
    drop(c);
    assert_eq!(unsafe { heap.close() }.unwrap(), CloseSummary::default());
}

#[test]
fn test_heap_outlives_its_handle() {
    let heap = HeapRegistry::create(HeapOptions::new(4096)).unwrap();
    let mut buffer = filled(&heap, BufferOptions::heap(), 64);
    drop(heap);

    // The buffer keeps its heap open.
    let owner = buffer.heap().unwrap().clone();
    assert!(owner.is_open());
    buffer.reallocate(128).unwrap();
    assert_eq!(&buffer.as_bytes()[..64], &pattern(64)[..]);
    let copy = buffer.try_clone().unwrap();
    assert!(copy.heap().unwrap().same_heap(&owner));
    assert_eq!(owner.dependent_count(), 2);
}

#[test]
fn test_copy_from_on_create() {
    let heap = HeapRegistry::create(HeapOptions::default()).unwrap();
    let source = NativeBuffer::from_bytes(BufferOptions::heap(), b"copied bytes").unwrap();
    let copy = heap.create_buffer(BufferOptions::aligned(8), Some(&source)).unwrap();
    assert_eq!(copy, source);
    assert_eq!(copy.backing_store(), BackingStore::Aligned);
}

#[test]
fn test_bounded_heap() {
    let options = HeapOptions::new(4096).with_max_size(64 * 1024);
    let heap = HeapRegistry::create(options).unwrap();
    assert_eq!(heap.initial_size(), 4096);
    assert_eq!(heap.max_size(), 64 * 1024);
    assert!(accountant().reserved() >= 64 * 1024);

    let mut buffer = heap.create_buffer(BufferOptions::heap(), None).unwrap();
    let err = buffer.allocate(1024 * 1024, false).unwrap_err();
    assert!(err.is_allocation_failure());
    assert!(!buffer.is_allocated());
    buffer.allocate(1000, true).unwrap();

    let measurement = heap.measure().unwrap();
    assert!(measurement.committed > 0);
    assert_eq!(
        measurement.total,
        measurement.committed + measurement.uncommitted
    );
}

#[test]
fn test_process_heap_is_permanent() {
    let process = HeapRegistry::process();
    let buffer = NativeBuffer::with_size(BufferOptions::heap(), 8).unwrap();
    assert!(buffer.heap().unwrap().same_heap(&process));
    let err = unsafe { process.close() }.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidOperation { .. }));
    assert!(process.measure().is_ok());
    assert_eq!(buffer.size(), 8);
}
