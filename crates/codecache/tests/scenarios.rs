//! End-to-end scenarios: cold write / warm read, overmap, relocation
//! filtering, cross-run ASLR, concurrent writers, and remove-while-draining.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use codecache::{
    AotData, CacheConfig, CacheMode, CacheOptions, CacheService, FileHeader, GuestMemory,
    Relocation, ThreadToken,
};

/// Buffer-backed guest address space.
struct TestMemory {
    segments: Mutex<HashMap<u64, Vec<u8>>>,
}

impl TestMemory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            segments: Mutex::new(HashMap::new()),
        })
    }

    fn map(&self, base: u64, bytes: Vec<u8>) {
        self.segments.lock().unwrap().insert(base, bytes);
    }

    fn poke(&self, addr: u64, value: u8) {
        let mut segments = self.segments.lock().unwrap();
        for (base, bytes) in segments.iter_mut() {
            if addr >= *base && addr - *base < bytes.len() as u64 {
                bytes[(addr - *base) as usize] = value;
                return;
            }
        }
        panic!("poke outside mapped guest memory: {addr:#x}");
    }
}

impl GuestMemory for TestMemory {
    fn read_exact(&self, addr: u64, buf: &mut [u8]) -> bool {
        let segments = self.segments.lock().unwrap();
        for (base, bytes) in segments.iter() {
            if addr >= *base {
                let start = (addr - *base) as usize;
                if let Some(src) = bytes.get(start..start + buf.len()) {
                    buf.copy_from_slice(src);
                    return true;
                }
            }
        }
        false
    }
}

fn service(dir: &Path, mem: &Arc<TestMemory>) -> CacheService {
    CacheService::new(
        CacheConfig::default(),
        CacheOptions::new(dir),
        Arc::clone(mem) as Arc<dyn GuestMemory>,
    )
    .unwrap()
}

fn translation(rip: u64, host: Vec<u8>, guest_len: u64, token: &ThreadToken) -> AotData {
    AotData {
        guest_rip: rip,
        host_code: host,
        host_code_hash: 0,
        guest_code_len: guest_len,
        guest_code_hash: 0,
        relocations: Vec::new(),
        thread_token: token.clone(),
    }
}

fn read_header(dir: &Path, name: &str) -> Option<FileHeader> {
    let file = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{name}-"))
        })?;
    FileHeader::parse(&std::fs::read(file.path()).unwrap())
}

#[test]
fn cold_write_then_warm_read() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    let mut code = vec![0u8; 0x1000];
    code[0x10..0x13].copy_from_slice(&[0x90, 0x90, 0xC3]);
    mem.map(0x4000_0000, code);

    let token = ThreadToken::new();
    {
        let svc = service(dir.path(), &mem);
        svc.add_named_region(0x4000_0000, 0x1000, 0, "/guest/libx", true);
        svc.submit_translation(translation(0x4000_0010, vec![0xAA; 8], 3, &token));
        svc.shutdown();
    }

    let header = read_header(dir.path(), "libx").unwrap();
    assert_eq!(header.num_records, 1);
    assert_eq!(header.total_code_size, 8);
    assert_eq!(header.original_base, 0x4000_0000);

    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x4000_0000, 0x1000, 0, "/guest/libx", true);

    let record = svc.fetch(0x4000_0010).expect("warm cache hit");
    assert_eq!(record.host_code(), vec![0xAA; 8]);
    assert_eq!(record.prefix().host_code_len, 8);
    assert_eq!(record.rip_offset(), 0x10);
    assert!(record.relocations().unwrap().is_empty());

    // Patch a guest byte inside the translated block: the integrity check
    // must miss, and miss again on the second try without touching the
    // file.
    mem.poke(0x4000_0012, 0x00);
    assert!(svc.fetch(0x4000_0010).is_none());
    assert!(svc.fetch(0x4000_0010).is_none());
    svc.shutdown();

    let header = read_header(dir.path(), "libx").unwrap();
    assert_eq!(header.num_records, 1);
}

#[test]
fn overmap_routes_to_new_region() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    mem.map(0x5000_0000, vec![0xC3; 0x2000]);

    let token = ThreadToken::new();
    {
        let svc = service(dir.path(), &mem);
        svc.add_named_region(0x5000_0000, 0x2000, 0, "/guest/liba", true);
        svc.submit_translation(translation(0x5000_0010, vec![0x11; 4], 1, &token));
        svc.shutdown();
    }

    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x5000_0000, 0x2000, 0, "/guest/liba", true);
    assert!(svc.fetch(0x5000_0010).is_some());

    // The guest overmaps the same range with a different library without
    // unmapping first.
    svc.add_named_region(0x5000_0000, 0x2000, 0, "/guest/libb", true);
    assert!(svc.fetch(0x5000_0010).is_none(), "must route to libb now");

    svc.submit_translation(translation(0x5000_0020, vec![0x22; 4], 1, &token));
    svc.shutdown();

    // The write landed in libb's file; liba's is untouched.
    let liba = read_header(dir.path(), "liba").unwrap();
    assert_eq!(liba.num_records, 1);
    let libb = read_header(dir.path(), "libb").unwrap();
    assert_eq!(libb.num_records, 1);
}

#[test]
fn escape_relocation_drops_record() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    mem.map(0x6000_0000, vec![0x90; 0x1000]);

    let token = ThreadToken::new();
    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x6000_0000, 0x1000, 0, "/guest/libesc", true);

    let mut data = translation(0x6000_0040, vec![0x33; 16], 2, &token);
    data.relocations.push(Relocation::GuestRipMove {
        guest_rip: 0x6100_0000,
        offset: 4,
    });
    svc.submit_translation(data);
    svc.shutdown();

    // The record escaped the region and was rejected wholesale; closure may
    // have deleted the empty file.
    match read_header(dir.path(), "libesc") {
        Some(header) => assert_eq!(header.num_records, 0),
        None => {}
    }
}

#[test]
fn cross_run_aslr_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let guest_page: Vec<u8> = (0..0x1000u32).map(|i| (i % 251) as u8).collect();

    // Run 1: the region sits at 0x7000_0000 and bakes the file.
    {
        let mem = TestMemory::new();
        mem.map(0x7000_0000, guest_page.clone());
        let token = ThreadToken::new();
        let svc = service(dir.path(), &mem);
        svc.add_named_region(0x7000_0000, 0x1000, 0, "/guest/libaslr", true);
        let mut data = translation(0x7000_0100, vec![0x44; 12], 4, &token);
        data.relocations.push(Relocation::GuestRipMove {
            guest_rip: 0x7000_0200,
            offset: 0,
        });
        svc.submit_translation(data);
        svc.shutdown();
    }

    // Run 2: ASLR moved the region to 0xA000_0000. The stored relocation
    // target stays in run 1's address space; the translator applies the
    // slide at install time via resolve_original_addr.
    {
        let mem = TestMemory::new();
        mem.map(0xA000_0000, guest_page.clone());
        let token = ThreadToken::new();
        let svc = service(dir.path(), &mem);
        svc.add_named_region(0xA000_0000, 0x1000, 0, "/guest/libaslr", true);

        let record = svc.fetch(0xA000_0100).expect("cache hit across ASLR");
        let relocs = record.relocations().unwrap();
        assert_eq!(
            relocs,
            vec![Relocation::GuestRipMove {
                guest_rip: 0x7000_0200,
                offset: 0,
            }]
        );
        assert_eq!(svc.resolve_original_addr(0x7000_0200), Some(0xA000_0200));

        // A record written this run gets its relocation rewritten into the
        // original (run 1) address space before it hits the file.
        let mut data = translation(0xA000_0300, vec![0x55; 8], 4, &token);
        data.relocations.push(Relocation::GuestRipMove {
            guest_rip: 0xA000_0180,
            offset: 2,
        });
        svc.submit_translation(data);
        svc.shutdown();
    }

    let header = read_header(dir.path(), "libaslr").unwrap();
    assert_eq!(header.num_records, 2);
    // Written exactly once, in the run that created the file.
    assert_eq!(header.original_base, 0x7000_0000);

    // Run 3: yet another base; the run 2 record must carry a run 1 target.
    {
        let mem = TestMemory::new();
        mem.map(0xB000_0000, guest_page);
        let svc = service(dir.path(), &mem);
        svc.add_named_region(0xB000_0000, 0x1000, 0, "/guest/libaslr", true);
        let record = svc.fetch(0xB000_0300).expect("run 2 record visible");
        assert_eq!(
            record.relocations().unwrap(),
            vec![Relocation::GuestRipMove {
                guest_rip: 0x7000_0180,
                offset: 2,
            }]
        );
        svc.shutdown();
    }
}

#[test]
fn concurrent_writers_single_region() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 50;

    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    let guest_page: Vec<u8> = (0..0x2000u32).map(|i| (i % 241) as u8).collect();
    mem.map(0x8000_0000, guest_page);

    {
        let svc = Arc::new(service(dir.path(), &mem));
        svc.add_named_region(0x8000_0000, 0x2000, 0, "/guest/libconc", true);

        let mut handles = Vec::new();
        for thread in 0..THREADS {
            let svc = Arc::clone(&svc);
            handles.push(std::thread::spawn(move || {
                let token = ThreadToken::new();
                for i in 0..PER_THREAD {
                    let slot = (thread * PER_THREAD + i) as u64;
                    let rip = 0x8000_0000 + slot * 16;
                    let host = vec![(slot & 0xff) as u8; 8];
                    svc.submit_translation(translation(rip, host, 4, &token));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        svc.shutdown();
    }

    let header = read_header(dir.path(), "libconc").unwrap();
    assert_eq!(header.num_records, (THREADS * PER_THREAD) as u64);
    assert_eq!(header.total_code_size, (THREADS * PER_THREAD * 8) as u64);

    // Every record round-trips on reload.
    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x8000_0000, 0x2000, 0, "/guest/libconc", true);
    for slot in 0..(THREADS * PER_THREAD) as u64 {
        let record = svc
            .fetch(0x8000_0000 + slot * 16)
            .expect("record survived reload");
        assert_eq!(record.host_code(), vec![(slot & 0xff) as u8; 8]);
    }
    svc.shutdown();
}

#[test]
fn remove_waits_for_write_drain() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    mem.map(0x9000_0000, vec![0x90; 0x2000]);

    let token = ThreadToken::new();
    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x9000_0000, 0x2000, 0, "/guest/librm", true);
    for i in 0..50u64 {
        svc.submit_translation(translation(0x9000_0000 + i * 16, vec![0x66; 8], 4, &token));
    }
    // Remove immediately: must return only after every submitted
    // translation has been written or rejected.
    svc.remove_named_region(0x9000_0000, 0x2000);

    let header = read_header(dir.path(), "librm").unwrap();
    assert_eq!(header.num_records, 50);
    let len_after_remove = std::fs::metadata(dir_file(dir.path(), "librm")).unwrap().len();

    // Nothing can commit to the file after the remove returned.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(
        std::fs::metadata(dir_file(dir.path(), "librm")).unwrap().len(),
        len_after_remove
    );

    // The region is gone: fetches and submits are misses/no-ops now.
    assert!(svc.fetch(0x9000_0010).is_none());
    svc.shutdown();
}

fn dir_file(dir: &Path, name: &str) -> std::path::PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{name}-"))
        })
        .map(|entry| entry.path())
        .unwrap()
}

#[test]
fn read_only_mode_never_creates_files() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    mem.map(0x4100_0000, vec![0xCC; 0x1000]);

    let token = ThreadToken::new();
    let options = CacheOptions {
        mode: CacheMode::ReadOnly,
        ..CacheOptions::new(dir.path())
    };
    let svc = CacheService::new(
        CacheConfig::default(),
        options,
        Arc::clone(&mem) as Arc<dyn GuestMemory>,
    )
    .unwrap();
    svc.add_named_region(0x4100_0000, 0x1000, 0, "/guest/libro", true);
    svc.submit_translation(translation(0x4100_0010, vec![0x77; 8], 2, &token));
    assert!(svc.fetch(0x4100_0010).is_none());
    svc.shutdown();

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn fork_parent_state_is_unaffected() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    mem.map(0x4200_0000, vec![0x90; 0x1000]);

    let token = ThreadToken::new();
    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x4200_0000, 0x1000, 0, "/guest/libfork", true);
    svc.submit_translation(translation(0x4200_0010, vec![0x88; 8], 2, &token));

    svc.prepare_for_fork(&token);
    svc.cleanup_after_fork(&token, codecache::ForkSide::Parent);

    // The service keeps working exactly as before.
    svc.submit_translation(translation(0x4200_0020, vec![0x99; 8], 2, &token));
    svc.shutdown();

    let header = read_header(dir.path(), "libfork").unwrap();
    assert_eq!(header.num_records, 2);

    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x4200_0000, 0x1000, 0, "/guest/libfork", true);
    assert!(svc.fetch(0x4200_0010).is_some());
    assert!(svc.fetch(0x4200_0020).is_some());
    svc.shutdown();
}

#[test]
fn relocate_addr_keeps_destination_file_alive() {
    let dir = tempfile::tempdir().unwrap();
    let mem = TestMemory::new();
    mem.map(0x4300_0000, vec![0x90; 0x1000]);

    let svc = service(dir.path(), &mem);
    svc.add_named_region(0x4300_0000, 0x1000, 0, "/guest/libdest", true);
    // Force the load to complete so the translation below is counted.
    assert!(svc.fetch(0x4300_0000).is_none());

    // A fresh region translates to itself, and the inbound-relocation
    // count keeps closure from deleting the (record-free) file.
    assert_eq!(svc.relocate_addr(0x4300_0040), Some(0x4300_0040));
    // Unregistered destinations (.bss and friends) are not relocatable.
    assert_eq!(svc.relocate_addr(0x9999_0000), None);
    svc.shutdown();

    assert!(dir
        .path()
        .read_dir()
        .unwrap()
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with("libdest-")));
}
