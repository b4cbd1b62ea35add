#![allow(unused)]

use std::sync::Arc;

mod common;

use common::{small_config, small_device, RamFlash};
use pion::{Config, FileType, Fs, FsError, OpenFlags, SeekFrom, DISK_VERSION};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 7 + 3) as u8).collect()
}

fn random_payload(seed: u64, n: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; n];
    rng.fill_bytes(&mut buf);
    buf
}

#[test]
fn test_format_mount() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let fs = Fs::mount(dev, small_config()).unwrap();
    let info = fs.fs_stat().unwrap();
    assert_eq!(info.disk_version, DISK_VERSION);
    assert_eq!(info.block_size, 512);
    assert_eq!(info.block_count, 64);
    fs.unmount().unwrap();
}

#[test]
fn test_mount_unformatted() {
    let dev = small_device();
    assert!(matches!(
        Fs::mount(dev, small_config()),
        Err(FsError::Corrupt)
    ));
}

#[test]
fn test_mount_autodetect_geometry() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    // block_count 0 takes the count from the superblock.
    let cfg = Config { block_count: 0, ..small_config() };
    let fs = Fs::mount(dev, cfg).unwrap();
    assert_eq!(fs.fs_stat().unwrap().block_count, 64);
    fs.unmount().unwrap();
}

#[test]
fn test_mount_wrong_geometry() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let cfg = Config { block_count: 48, ..small_config() };
    assert!(matches!(Fs::mount(dev, cfg), Err(FsError::Invalid)));
}

#[test]
fn test_format_too_small() {
    let dev = Arc::new(RamFlash::new(512, 2));
    let cfg = Config { block_count: 2, ..small_config() };
    assert!(matches!(Fs::format(dev, cfg), Err(FsError::Invalid)));
}

#[test]
fn test_inline_file_roundtrip() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    let f = fs.open("/hello", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    assert_eq!(fs.write(f, b"hello world").unwrap(), 11);
    assert_eq!(fs.size(f).unwrap(), 11);
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    assert_eq!(fs.stat("/hello").unwrap().size, 11);
    let f = fs.open("/hello", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.read(f, &mut buf).unwrap(), 11);
    assert_eq!(&buf[..11], b"hello world");
    assert_eq!(fs.read(f, &mut buf).unwrap(), 0);
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_large_file_roundtrip() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    // Well past the inline limit, spanning several blocks.
    let data = random_payload(42, 5000);
    let f = fs.open("/big", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    assert_eq!(fs.write(f, &data).unwrap(), data.len());
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    assert_eq!(fs.stat("/big").unwrap().size, 5000);
    let f = fs.open("/big", OpenFlags::RDONLY).unwrap();
    let mut got = vec![0u8; 5000];
    assert_eq!(fs.read(f, &mut got).unwrap(), 5000);
    assert_eq!(got, data);

    // Random access within the chain.
    fs.seek(f, SeekFrom::Start(4000)).unwrap();
    let mut tail = vec![0u8; 1000];
    assert_eq!(fs.read(f, &mut tail).unwrap(), 1000);
    assert_eq!(tail, data[4000..]);
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_sync_unaligned_tail() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    // Past the inline limit, with a tail short of the 64-byte cache
    // boundary; sync must push that tail to the device, not leave it in
    // the handle's cache.
    let data = random_payload(9, 200);
    let f = fs.open("/tail", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &data).unwrap();
    fs.fsync(f).unwrap();
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    let f = fs.open("/tail", OpenFlags::RDONLY).unwrap();
    let mut got = vec![0u8; 200];
    assert_eq!(fs.read(f, &mut got).unwrap(), 200);
    assert_eq!(got, data);
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_seek_tell_rewind() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    let data = pattern(1000);
    let f = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &data).unwrap();
    assert_eq!(fs.tell(f).unwrap(), 1000);

    assert_eq!(fs.seek(f, SeekFrom::Start(100)).unwrap(), 100);
    assert_eq!(fs.seek(f, SeekFrom::Current(-50)).unwrap(), 50);
    assert_eq!(fs.seek(f, SeekFrom::End(-100)).unwrap(), 900);
    let mut buf = [0u8; 10];
    fs.read(f, &mut buf).unwrap();
    assert_eq!(buf, data[900..910]);

    assert!(matches!(
        fs.seek(f, SeekFrom::Current(-2000)),
        Err(FsError::Invalid)
    ));

    fs.rewind(f).unwrap();
    assert_eq!(fs.tell(f).unwrap(), 0);
    fs.read(f, &mut buf).unwrap();
    assert_eq!(buf, data[..10]);
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_truncate() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    let data = pattern(2000);
    let f = fs.open("/t", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &data).unwrap();

    // Shrink below the inline limit, then grow with a zero-filled tail.
    fs.truncate(f, 40).unwrap();
    assert_eq!(fs.size(f).unwrap(), 40);
    fs.truncate(f, 600).unwrap();
    assert_eq!(fs.size(f).unwrap(), 600);
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    let f = fs.open("/t", OpenFlags::RDONLY).unwrap();
    let mut got = vec![0u8; 600];
    assert_eq!(fs.read(f, &mut got).unwrap(), 600);
    assert_eq!(got[..40], data[..40]);
    assert!(got[40..].iter().all(|&b| b == 0));
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_append_and_trunc_flags() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    let f = fs.open("/log", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"one").unwrap();
    fs.close(f).unwrap();

    let f = fs.open("/log", OpenFlags::RDWR | OpenFlags::APPEND).unwrap();
    fs.rewind(f).unwrap();
    fs.write(f, b"two").unwrap();
    assert_eq!(fs.size(f).unwrap(), 6);
    fs.close(f).unwrap();

    let f = fs.open("/log", OpenFlags::RDWR | OpenFlags::TRUNC).unwrap();
    assert_eq!(fs.size(f).unwrap(), 0);
    fs.close(f).unwrap();
    assert_eq!(fs.stat("/log").unwrap().size, 0);
    fs.unmount().unwrap();
}

#[test]
fn test_open_errors() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    assert!(matches!(
        fs.open("/nope", OpenFlags::RDONLY),
        Err(FsError::NotFound)
    ));

    let f = fs
        .open("/x", OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL)
        .unwrap();
    fs.close(f).unwrap();
    assert!(matches!(
        fs.open("/x", OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL),
        Err(FsError::Exists)
    ));

    fs.mkdir("/d").unwrap();
    assert!(matches!(fs.open("/d", OpenFlags::RDWR), Err(FsError::IsDir)));

    // A second handle on the same file is refused.
    let f = fs.open("/x", OpenFlags::RDONLY).unwrap();
    assert!(matches!(
        fs.open("/x", OpenFlags::RDONLY),
        Err(FsError::Invalid)
    ));
    fs.close(f).unwrap();

    // Writing through a read-only handle is refused.
    let f = fs.open("/x", OpenFlags::RDONLY).unwrap();
    assert!(matches!(fs.write(f, b"no"), Err(FsError::BadFile)));
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_mkdir_readdir() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    let f = fs.open("/a/f1", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"data").unwrap();
    fs.close(f).unwrap();
    let f = fs.open("/a/f2", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.close(f).unwrap();

    assert!(matches!(fs.mkdir("/a"), Err(FsError::Exists)));
    assert!(matches!(fs.mkdir("/missing/x"), Err(FsError::NotFound)));
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    let d = fs.opendir("/a").unwrap();
    let mut names = Vec::new();
    while let Some(info) = fs.readdir(d).unwrap() {
        names.push((info.name, info.file_type, info.size));
    }
    fs.closedir(d).unwrap();
    assert_eq!(
        names,
        vec![
            (".".to_string(), FileType::Dir, 0),
            ("..".to_string(), FileType::Dir, 0),
            ("b".to_string(), FileType::Dir, 0),
            ("f1".to_string(), FileType::File, 4),
            ("f2".to_string(), FileType::File, 0),
        ]
    );
    fs.unmount().unwrap();
}

#[test]
fn test_dir_seek_tell() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    for i in 0..5 {
        let f = fs
            .open(&format!("/f{i}"), OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        fs.close(f).unwrap();
    }

    let d = fs.opendir("/").unwrap();
    fs.readdir(d).unwrap(); // .
    fs.readdir(d).unwrap(); // ..
    let third = fs.readdir(d).unwrap().unwrap();
    let pos = fs.dir_tell(d).unwrap();
    fs.readdir(d).unwrap();
    fs.dir_seek(d, pos).unwrap();
    assert_eq!(fs.readdir(d).unwrap().unwrap().name, "f1");

    fs.dir_rewind(d).unwrap();
    assert_eq!(fs.readdir(d).unwrap().unwrap().name, ".");
    assert_eq!(third.name, "f0");
    fs.closedir(d).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_root_log_compaction() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    // Enough entries and deletions to overflow a 512-byte log several
    // times over, forcing compaction and possibly a split.
    for i in 0..30 {
        let name = format!("/n{i:02}");
        let f = fs.open(&name, OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
        fs.write(f, name.as_bytes()).unwrap();
        fs.close(f).unwrap();
    }
    for i in 0..30 {
        if i % 3 == 0 {
            fs.remove(&format!("/n{i:02}")).unwrap();
        }
    }
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    for i in 0..30 {
        let name = format!("/n{i:02}");
        if i % 3 == 0 {
            assert!(matches!(fs.stat(&name), Err(FsError::NotFound)));
        } else {
            assert_eq!(fs.stat(&name).unwrap().size, name.len() as u32);
        }
    }
    fs.unmount().unwrap();
}

#[test]
fn test_open_handle_survives_commits() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    let f = fs.open("/held", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"before").unwrap();
    fs.fsync(f).unwrap();

    // Churn the parent log underneath the open handle.
    for i in 0..25 {
        let g = fs
            .open(&format!("/churn{i}"), OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        fs.close(g).unwrap();
    }
    for i in 0..25 {
        fs.remove(&format!("/churn{i}")).unwrap();
    }

    fs.seek(f, SeekFrom::End(0)).unwrap();
    fs.write(f, b" after").unwrap();
    fs.close(f).unwrap();

    let f = fs.open("/held", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.read(f, &mut buf).unwrap(), 12);
    assert_eq!(&buf[..12], b"before after");
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_handles_follow_directory_split() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    let held = fs.open("/held", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(held, b"anchor").unwrap();
    fs.fsync(held).unwrap();

    // Enough entries that compaction has to split the root across tail
    // pairs, renumbering ids, while a handle stays open. Every creation
    // must still land on the entry it just made.
    for i in 0..40 {
        let name = format!("/s{i:02}");
        let f = fs.open(&name, OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
        fs.write(f, name.as_bytes()).unwrap();
        fs.close(f).unwrap();
        assert_eq!(fs.stat(&name).unwrap().size, name.len() as u32, "{name}");
    }

    fs.seek(held, SeekFrom::End(0)).unwrap();
    fs.write(held, b" tail").unwrap();
    fs.close(held).unwrap();

    let f = fs.open("/held", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(f, &mut buf).unwrap(), 11);
    assert_eq!(&buf[..11], b"anchor tail");
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    for i in 0..40 {
        let name = format!("/s{i:02}");
        assert_eq!(fs.stat(&name).unwrap().size, name.len() as u32, "{name}");
    }
    assert_eq!(fs.stat("/held").unwrap().size, 11);
    fs.unmount().unwrap();
}

#[test]
fn test_remove() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    let f = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &pattern(3000)).unwrap();
    fs.close(f).unwrap();
    fs.mkdir("/d").unwrap();
    let f = fs.open("/d/inner", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.close(f).unwrap();

    let used = fs.fs_size().unwrap();
    fs.remove("/f").unwrap();
    assert!(matches!(fs.stat("/f"), Err(FsError::NotFound)));
    assert!(fs.fs_size().unwrap() < used);

    assert!(matches!(fs.remove("/d"), Err(FsError::NotEmpty)));
    fs.remove("/d/inner").unwrap();
    fs.remove("/d").unwrap();
    assert!(matches!(fs.stat("/d"), Err(FsError::NotFound)));
    assert!(matches!(fs.remove("/"), Err(FsError::Invalid)));
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    assert!(matches!(fs.stat("/f"), Err(FsError::NotFound)));
    fs.unmount().unwrap();
}

#[test]
fn test_rename_same_dir() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    let f = fs.open("/old", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"payload").unwrap();
    fs.close(f).unwrap();

    fs.rename("/old", "/new").unwrap();
    assert!(matches!(fs.stat("/old"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/new").unwrap().size, 7);

    // Overwriting an existing file.
    let f = fs.open("/other", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"x").unwrap();
    fs.close(f).unwrap();
    fs.rename("/new", "/other").unwrap();
    assert_eq!(fs.stat("/other").unwrap().size, 7);
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    let f = fs.open("/other", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(f, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"payload");
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_rename_across_dirs() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    fs.mkdir("/src").unwrap();
    fs.mkdir("/dst").unwrap();
    let f = fs.open("/src/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &pattern(2000)).unwrap();
    fs.close(f).unwrap();

    fs.rename("/src/f", "/dst/g").unwrap();
    assert!(matches!(fs.stat("/src/f"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/dst/g").unwrap().size, 2000);

    // Moving a directory, overwriting an empty directory at the target.
    fs.mkdir("/src/sub").unwrap();
    fs.mkdir("/dst/sub").unwrap();
    fs.rename("/src/sub", "/dst/sub").unwrap();
    assert!(matches!(fs.stat("/src/sub"), Err(FsError::NotFound)));
    assert_eq!(fs.stat("/dst/sub").unwrap().file_type, FileType::Dir);

    // Type mismatches are refused.
    assert!(matches!(
        fs.rename("/dst/g", "/dst/sub"),
        Err(FsError::IsDir)
    ));
    assert!(matches!(
        fs.rename("/dst/sub", "/dst/g"),
        Err(FsError::NotDir)
    ));
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    let f = fs.open("/dst/g", OpenFlags::RDONLY).unwrap();
    let mut got = vec![0u8; 2000];
    assert_eq!(fs.read(f, &mut got).unwrap(), 2000);
    assert_eq!(got, pattern(2000));
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_user_attrs() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    let f = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.close(f).unwrap();

    fs.setattr("/f", b't', b"2026-08-23").unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.getattr("/f", b't', &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"2026-08-23");

    // A short buffer still reports the full size.
    let mut short = [0u8; 4];
    assert_eq!(fs.getattr("/f", b't', &mut short).unwrap(), 10);
    assert_eq!(&short, b"2026");

    // Attributes on the root live on the superblock entry.
    fs.setattr("/", b'r', b"rootattr").unwrap();
    assert_eq!(fs.getattr("/", b'r', &mut buf).unwrap(), 8);

    assert!(matches!(
        fs.getattr("/f", b'z', &mut buf),
        Err(FsError::NoAttr)
    ));
    fs.removeattr("/f", b't').unwrap();
    assert!(matches!(
        fs.getattr("/f", b't', &mut buf),
        Err(FsError::NoAttr)
    ));
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    assert_eq!(fs.getattr("/", b'r', &mut buf).unwrap(), 8);
    fs.unmount().unwrap();
}

#[test]
fn test_attrs_survive_rename() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    fs.mkdir("/d").unwrap();
    let f = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"body").unwrap();
    fs.close(f).unwrap();
    fs.setattr("/f", b'k', b"kept").unwrap();

    fs.rename("/f", "/d/f").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.getattr("/d/f", b'k', &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"kept");
    assert_eq!(fs.stat("/d/f").unwrap().size, 4);
    fs.unmount().unwrap();
}

#[test]
fn test_path_handling() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    fs.mkdir("/a").unwrap();
    let f = fs.open("/a/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.close(f).unwrap();

    // Normalization: dots, double slashes, parent references.
    assert!(fs.stat("//a/./f").is_ok());
    assert!(fs.stat("/a/../a/f").is_ok());
    assert!(fs.stat("/../a/f").is_ok());
    assert_eq!(fs.stat("/").unwrap().file_type, FileType::Dir);

    // A file used as an intermediate component.
    assert!(matches!(fs.stat("/a/f/x"), Err(FsError::NotDir)));

    let long = "x".repeat(1100);
    assert!(matches!(
        fs.mkdir(&format!("/{long}")),
        Err(FsError::NameTooLong)
    ));
    fs.unmount().unwrap();
}

#[test]
fn test_fill_to_no_space() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    let f = fs.open("/fill", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    let chunk = pattern(512);
    let mut err = None;
    for _ in 0..100 {
        match fs.write(f, &chunk) {
            Ok(_) => {}
            Err(e) => {
                err = Some(e);
                break;
            }
        }
    }
    assert_eq!(err, Some(FsError::NoSpace));
    fs.close(f).unwrap();

    // Space comes back after removing the file.
    fs.remove("/fill").unwrap();
    let f = fs.open("/again", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    assert_eq!(fs.write(f, &chunk).unwrap(), 512);
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_traverse_and_fs_size() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();

    // Superblock pair plus root pair at minimum.
    let base = fs.fs_size().unwrap();
    assert!(base >= 4);

    let f = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &pattern(4096)).unwrap();
    fs.fsync(f).unwrap();
    let used = fs.fs_size().unwrap();
    assert!(used > base);
    assert!(used <= 64);

    let mut seen = Vec::new();
    fs.traverse(|b| seen.push(b)).unwrap();
    assert!(seen.iter().all(|&b| b < 64));
    assert!(seen.contains(&0) && seen.contains(&1));
    fs.close(f).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_grow() {
    let dev = Arc::new(RamFlash::new(512, 64));
    let cfg = Config { block_count: 32, ..small_config() };
    Fs::format(dev.clone(), cfg.clone()).unwrap();
    let mut fs = Fs::mount(dev.clone(), cfg).unwrap();

    fs.grow(64).unwrap();
    assert_eq!(fs.fs_stat().unwrap().block_count, 64);

    // The new capacity is usable right away.
    let f = fs.open("/big", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, &pattern(20 * 1024)).unwrap();
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    // The resize is durable.
    let cfg = Config { block_count: 0, ..small_config() };
    let mut fs = Fs::mount(dev, cfg).unwrap();
    assert_eq!(fs.fs_stat().unwrap().block_count, 64);
    assert_eq!(fs.stat("/big").unwrap().size, 20 * 1024);

    // Shrinking under live data is refused.
    assert!(matches!(fs.grow(8), Err(FsError::Invalid)));
    fs.unmount().unwrap();
}

#[test]
fn test_gc() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev.clone(), small_config()).unwrap();

    // Pile small commits into the root log, then compact it.
    for i in 0..20 {
        fs.setattr("/", b'a', format!("value{i}").as_bytes()).unwrap();
    }
    fs.gc().unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(fs.getattr("/", b'a', &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"value19");
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, small_config()).unwrap();
    assert_eq!(fs.getattr("/", b'a', &mut buf).unwrap(), 7);
    fs.unmount().unwrap();
}

#[test]
fn test_wear_relocation() {
    let dev = small_device();
    let cfg = Config { block_cycles: 4, ..small_config() };
    Fs::format(dev.clone(), cfg.clone()).unwrap();
    let mut fs = Fs::mount(dev.clone(), cfg.clone()).unwrap();

    fs.mkdir("/d").unwrap();
    // Enough commits on one pair to trip the cycle limit repeatedly, so
    // the pair migrates and the parent link has to follow it.
    for i in 0..40 {
        let name = format!("/d/f{i}");
        let f = fs.open(&name, OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
        fs.close(f).unwrap();
        fs.remove(&name).unwrap();
    }
    let f = fs.open("/d/last", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    fs.write(f, b"still here").unwrap();
    fs.close(f).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, cfg).unwrap();
    assert_eq!(fs.stat("/d/last").unwrap().size, 10);
    fs.unmount().unwrap();
}

#[test]
fn test_unmount_with_open_handle() {
    let dev = small_device();
    Fs::format(dev.clone(), small_config()).unwrap();
    let mut fs = Fs::mount(dev, small_config()).unwrap();
    let _f = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    assert!(matches!(fs.unmount(), Err(FsError::Invalid)));
}
