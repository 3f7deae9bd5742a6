//! End-to-end copy tests over in-memory links.

use copy::msg::CopyRequest;
use copy::{client, server, ErrorCode};
use network::fiber::Demux;

async fn start_pair() -> (Demux, tokio::task::JoinHandle<()>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client_demux = Demux::new(a);
    let server_demux = Demux::new(b);
    let server_task = tokio::spawn(async move {
        let _ = server::run(server_demux).await;
    });
    tokio::task::yield_now().await;
    (client_demux, server_task)
}

fn request(input: &str, output: &str) -> CopyRequest {
    CopyRequest {
        is_from_stdin: false,
        is_resume: false,
        is_recursive: false,
        check_integrity: true,
        max_parallel: 1,
        get_from_server: false,
        input_pattern: input.into(),
        output_pattern: output.into(),
    }
}

async fn digest(path: &std::path::Path) -> [u8; 20] {
    common::crypto::file_digest(path).await.unwrap()
}

#[tokio::test]
async fn test_single_file_to_server() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    let input = dir.join("in/file.bin");
    tokio::fs::create_dir(dir.join("in")).await.unwrap();
    tokio::fs::create_dir(dir.join("out")).await.unwrap();
    common::testutils::write_random_file(&input, 1024 * 1024 + 37)
        .await
        .unwrap();

    let (demux, _server) = start_pair().await;
    let output = dir.join("out/file.bin");
    let req = request(input.to_str().unwrap(), output.to_str().unwrap());
    let summary = client::copy_to_server(&demux, req).await.unwrap();

    assert_eq!(summary.error_code, ErrorCode::Success);
    assert_eq!(summary.files_count, 1);
    assert_eq!(summary.errors_count, 0);
    assert_eq!(digest(&input).await, digest(&output).await);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_glob_parallel_to_server() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    tokio::fs::create_dir(dir.join("in")).await.unwrap();
    tokio::fs::create_dir(dir.join("out")).await.unwrap();
    // sizes from empty up, stepping over the packet payload size
    let sizes = [0usize, 1, 64 * 1024, 64 * 1024 + 1, 300_000];
    for (i, size) in sizes.iter().enumerate() {
        common::testutils::write_random_file(&dir.join(format!("in/{i}.bin")), *size)
            .await
            .unwrap();
    }
    tokio::fs::write(dir.join("in/skip.txt"), b"not matched")
        .await
        .unwrap();

    let (demux, _server) = start_pair().await;
    let mut req = request(
        &format!("{}/in/*.bin", dir.display()),
        dir.join("out").to_str().unwrap(),
    );
    req.max_parallel = 3;
    let summary = client::copy_to_server(&demux, req).await.unwrap();

    assert_eq!(summary.error_code, ErrorCode::Success);
    assert_eq!(summary.files_count, sizes.len() as u64);
    assert_eq!(summary.errors_count, 0);
    for (i, _) in sizes.iter().enumerate() {
        let input = dir.join(format!("in/{i}.bin"));
        let output = dir.join(format!("out/{i}.bin"));
        assert_eq!(digest(&input).await, digest(&output).await, "file {i}");
    }
    assert!(!dir.join("out/skip.txt").exists());
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_resume_completes_partial_output() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    tokio::fs::create_dir(dir.join("in")).await.unwrap();
    tokio::fs::create_dir(dir.join("out")).await.unwrap();
    let input = dir.join("in/file.bin");
    let payload = common::testutils::write_random_file(&input, 1024 * 1024)
        .await
        .unwrap();
    // the receiver already holds the first 400000 bytes, exactly
    let output = dir.join("out/file.bin");
    tokio::fs::write(&output, &payload[..400_000]).await.unwrap();

    let (demux, _server) = start_pair().await;
    let mut req = request(input.to_str().unwrap(), output.to_str().unwrap());
    req.is_resume = true;
    let summary = client::copy_to_server(&demux, req).await.unwrap();

    assert_eq!(summary.error_code, ErrorCode::Success);
    assert_eq!(digest(&input).await, digest(&output).await);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_resume_mismatch_rejected() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    tokio::fs::create_dir(dir.join("in")).await.unwrap();
    tokio::fs::create_dir(dir.join("out")).await.unwrap();
    let input = dir.join("in/file.bin");
    common::testutils::write_random_file(&input, 1024 * 1024)
        .await
        .unwrap();
    // unrelated bytes in the partial output file
    let output = dir.join("out/file.bin");
    common::testutils::write_random_file(&output, 500_000)
        .await
        .unwrap();

    let (demux, _server) = start_pair().await;
    let mut req = request(input.to_str().unwrap(), output.to_str().unwrap());
    req.is_resume = true;
    let summary = client::copy_to_server(&demux, req).await.unwrap();

    assert_eq!(summary.errors_count, 1);
    assert_eq!(summary.error_code, ErrorCode::ResumeFileTransferNotPermitted);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_copy_from_server() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    tokio::fs::create_dir(dir.join("srv")).await.unwrap();
    tokio::fs::create_dir(dir.join("local")).await.unwrap();
    for i in 0..3 {
        common::testutils::write_random_file(&dir.join(format!("srv/{i}.bin")), 200_000 + i)
            .await
            .unwrap();
    }

    let (demux, _server) = start_pair().await;
    let mut req = request(
        &format!("{}/srv/*.bin", dir.display()),
        dir.join("local").to_str().unwrap(),
    );
    req.max_parallel = 2;
    let summary = client::copy_from_server(&demux, req).await.unwrap();

    assert_eq!(summary.error_code, ErrorCode::Success);
    assert_eq!(summary.files_count, 3);
    assert_eq!(summary.errors_count, 0);
    for i in 0..3 {
        assert_eq!(
            digest(&dir.join(format!("srv/{i}.bin"))).await,
            digest(&dir.join(format!("local/{i}.bin"))).await
        );
    }
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_output_directory_target_keeps_input_name() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    tokio::fs::create_dir(dir.join("in")).await.unwrap();
    tokio::fs::create_dir(dir.join("out")).await.unwrap();
    let input = dir.join("in/named.bin");
    common::testutils::write_random_file(&input, 10_000).await.unwrap();

    let (demux, _server) = start_pair().await;
    // output pattern is an existing directory, not a file path
    let req = request(input.to_str().unwrap(), dir.join("out").to_str().unwrap());
    let summary = client::copy_to_server(&demux, req).await.unwrap();

    assert_eq!(summary.error_code, ErrorCode::Success);
    assert!(dir.join("out/named.bin").exists());
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_missing_input_reports_listing_failure() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    let (demux, _server) = start_pair().await;
    let req = request(
        &format!("{}/nosuchdir/*.bin", dir.display()),
        dir.to_str().unwrap(),
    );
    let summary = client::copy_to_server(&demux, req).await.unwrap();
    assert_eq!(summary.error_code, ErrorCode::SenderInputFileListingFailed);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_without_integrity_check() {
    let dir = common::testutils::setup_test_dir().await.unwrap();
    tokio::fs::create_dir(dir.join("in")).await.unwrap();
    tokio::fs::create_dir(dir.join("out")).await.unwrap();
    let input = dir.join("in/file.bin");
    common::testutils::write_random_file(&input, 128 * 1024)
        .await
        .unwrap();

    let (demux, _server) = start_pair().await;
    let output = dir.join("out/file.bin");
    let mut req = request(input.to_str().unwrap(), output.to_str().unwrap());
    req.check_integrity = false;
    let summary = client::copy_to_server(&demux, req).await.unwrap();

    assert_eq!(summary.error_code, ErrorCode::Success);
    assert_eq!(digest(&input).await, digest(&output).await);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}
