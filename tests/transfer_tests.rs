//! Tests for streaming directory transfer

use buckos_bootstrap::transfer::copy_dir;
use buckos_bootstrap::Error;
use nix::unistd::geteuid;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Source tree with `d/a.txt` and its hard link `d/b.txt`
fn create_linked_tree() -> TempDir {
    let src = TempDir::new().expect("Failed to create temp dir");
    fs::create_dir(src.path().join("d")).unwrap();
    fs::write(src.path().join("d/a.txt"), "hi").unwrap();
    fs::hard_link(src.path().join("d/a.txt"), src.path().join("d/b.txt")).unwrap();
    src
}

fn inode(path: &Path) -> (u64, u64) {
    let meta = fs::symlink_metadata(path).unwrap();
    (meta.dev(), meta.ino())
}

mod round_trip {
    use super::*;

    #[tokio::test]
    async fn test_copy_preserves_hard_links() {
        let src = create_linked_tree();
        let dest = TempDir::new().unwrap();

        copy_dir(src.path(), dest.path()).await.unwrap();

        let a = dest.path().join("d/a.txt");
        let b = dest.path().join("d/b.txt");
        assert!(dest.path().join("d").is_dir());
        assert_eq!(fs::read_to_string(&a).unwrap(), "hi");
        assert_eq!(fs::read_to_string(&b).unwrap(), "hi");
        assert_eq!(inode(&a), inode(&b));
        assert_eq!(fs::metadata(&a).unwrap().nlink(), 2);
    }

    #[tokio::test]
    async fn test_copy_nested_directories() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("usr/lib/modules/6.1")).unwrap();
        fs::create_dir_all(src.path().join("etc/empty")).unwrap();
        fs::write(src.path().join("usr/lib/modules/6.1/modules.dep"), "dep").unwrap();
        fs::write(src.path().join("etc/hostname"), "buckos\n").unwrap();

        let dest = TempDir::new().unwrap();
        copy_dir(src.path(), dest.path()).await.unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("usr/lib/modules/6.1/modules.dep")).unwrap(),
            "dep"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("etc/hostname")).unwrap(),
            "buckos\n"
        );
        assert!(dest.path().join("etc/empty").is_dir());
    }

    #[tokio::test]
    async fn test_copy_large_file() {
        let src = TempDir::new().unwrap();
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(src.path().join("blob.bin"), &data).unwrap();

        let dest = TempDir::new().unwrap();
        copy_dir(src.path(), dest.path()).await.unwrap();

        assert_eq!(fs::read(dest.path().join("blob.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_copy_creates_missing_dest() {
        let src = create_linked_tree();
        let scratch = TempDir::new().unwrap();
        let dest = scratch.path().join("new/root");

        copy_dir(src.path(), &dest).await.unwrap();
        assert_eq!(fs::read_to_string(dest.join("d/a.txt")).unwrap(), "hi");
    }
}

mod metadata {
    use super::*;

    #[tokio::test]
    async fn test_copy_symlinks() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("target.txt"), "data").unwrap();
        std::os::unix::fs::symlink("target.txt", src.path().join("link")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/elsewhere", src.path().join("dangling")).unwrap();

        let dest = TempDir::new().unwrap();
        copy_dir(src.path(), dest.path()).await.unwrap();

        let link = dest.path().join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("target.txt"));
        assert_eq!(fs::read_to_string(&link).unwrap(), "data");
        assert_eq!(
            fs::read_link(dest.path().join("dangling")).unwrap(),
            Path::new("/nonexistent/elsewhere")
        );
    }

    #[tokio::test]
    async fn test_copy_preserves_modes() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("bin")).unwrap();
        let tool = src.path().join("bin/tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let secret = src.path().join("secret");
        fs::write(&secret, "s").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(src.path().join("bin"), fs::Permissions::from_mode(0o750)).unwrap();

        let dest = TempDir::new().unwrap();
        copy_dir(src.path(), dest.path()).await.unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&dest.path().join("bin/tool")), 0o755);
        assert_eq!(mode(&dest.path().join("secret")), 0o600);
        assert_eq!(mode(&dest.path().join("bin")), 0o750);
    }
}

mod failures {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_source_is_file() {
        let scratch = TempDir::new().unwrap();
        let file = scratch.path().join("file");
        fs::write(&file, "x").unwrap();

        let err = copy_dir(&file, scratch.path().join("dest")).await.unwrap_err();
        assert_matches!(err, Error::Transfer(_));
        assert!(!scratch.path().join("dest").exists());
    }

    #[tokio::test]
    async fn test_source_missing() {
        let scratch = TempDir::new().unwrap();
        let err = copy_dir(scratch.path().join("missing"), scratch.path().join("dest"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Io(_));
    }

    /// Deadline for a transfer that must fail rather than hang.
    const FAIL_DEADLINE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_destination_entry_blocks_directory() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("d")).unwrap();
        fs::write(src.path().join("d/big.bin"), vec![7u8; 4 * 1024 * 1024]).unwrap();
        fs::write(src.path().join("z.txt"), "after").unwrap();

        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("d"), "in the way").unwrap();

        let err = tokio::time::timeout(FAIL_DEADLINE, copy_dir(src.path(), dest.path()))
            .await
            .expect("transfer should fail instead of hanging")
            .unwrap_err();
        assert_matches!(err, Error::Io(_));
        assert_eq!(fs::read_to_string(dest.path().join("d")).unwrap(), "in the way");
    }

    #[tokio::test]
    async fn test_unreadable_source_file() {
        if geteuid().is_root() {
            // Permission bits do not stop root.
            return;
        }

        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.bin"), vec![1u8; 4 * 1024 * 1024]).unwrap();
        let secret = src.path().join("b.secret");
        fs::write(&secret, "hidden").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
        fs::write(src.path().join("c.txt"), "after").unwrap();

        let dest = TempDir::new().unwrap();
        let err = tokio::time::timeout(FAIL_DEADLINE, copy_dir(src.path(), dest.path()))
            .await
            .expect("transfer should fail instead of hanging")
            .unwrap_err();
        assert_matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::PermissionDenied);
        assert!(!dest.path().join("c.txt").exists());
    }
}
