// End-to-end tests for the event loop: loopback bus, stub projector, real
// status pipe, commands fed through the engine's channel.
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use resind::config::Settings;
use resind::engine::Engine;
use resind::error::ErrorCode;
use resind::event::{Command, UnknownCommand};
use resind::status::{STATUS_RECORD_LEN, StateCode, StatusChange, UiSubState};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Record {
    state: u8,
    substate: u8,
    change: u8,
    current_layer: u32,
    num_layers: u32,
    error_code: u16,
    is_error: bool,
}

fn read_records(path: &Path) -> Vec<Record> {
    // The engine keeps both ends open, so a non-blocking read drains
    // whatever was published.
    let mut pipe = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .unwrap();
    let mut bytes = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("status pipe read failed: {e}"),
        }
    }
    assert_eq!(bytes.len() % STATUS_RECORD_LEN, 0, "partial record on pipe");
    bytes
        .chunks(STATUS_RECORD_LEN)
        .map(|r| Record {
            state: r[0],
            substate: r[1],
            change: r[2],
            current_layer: u32::from_le_bytes(r[3..7].try_into().unwrap()),
            num_layers: u32::from_le_bytes(r[7..11].try_into().unwrap()),
            error_code: u16::from_le_bytes(r[15..17].try_into().unwrap()),
            is_error: r[21] != 0,
        })
        .collect()
}

fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.paths.status_pipe = root.join("status").to_string_lossy().into_owned();
    settings.paths.command_pipe = root.join("command").to_string_lossy().into_owned();
    settings.paths.download_dir = root.join("download").to_string_lossy().into_owned();
    settings.paths.print_data_dir = root.join("print").to_string_lossy().into_owned();
    settings.motor.timeout_sec = 0.05;
    settings
}

fn write_bundle(dir: &Path, layers: u32, printsettings: Option<&str>) {
    fs::create_dir_all(dir).unwrap();
    for n in 1..=layers {
        fs::write(dir.join(format!("slice_{n}.png")), b"png").unwrap();
    }
    if let Some(contents) = printsettings {
        fs::write(dir.join("printsettings.toml"), contents).unwrap();
    }
}

fn entered(records: &[Record]) -> Vec<u8> {
    records
        .iter()
        .filter(|r| r.change == StatusChange::Entering as u8)
        .map(|r| r.state)
        .collect()
}

#[tokio::test]
async fn watchdog_drives_bringup_failure_into_error_and_reset_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::without_hardware(test_settings(dir.path())).unwrap();
    let tx = engine.command_sender();
    let status_path = engine.status_pipe_path().to_path_buf();

    let driver = tokio::spawn(async move {
        // Nothing answers the homing batch: let the watchdog fire
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(Ok(Command::Reset)).await.unwrap();
        tx.send(Ok(Command::Start)).await.unwrap();
        tx.send(Ok(Command::Exit)).await.unwrap();
    });

    engine.run().await.unwrap();
    driver.await.unwrap();

    let records = read_records(&status_path);
    let states = entered(&records);
    assert_eq!(
        states,
        vec![
            StateCode::Initializing as u8,
            StateCode::Error as u8,
            StateCode::Idle as u8,
        ]
    );

    // The watchdog raised exactly one fatal timeout, and the start without
    // print data exactly one warning; each on exactly one record.
    let timeouts: Vec<_> = records
        .iter()
        .filter(|r| r.error_code == ErrorCode::MotorTimeoutError.as_u16())
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert!(timeouts[0].is_error);
    let no_data: Vec<_> = records
        .iter()
        .filter(|r| r.error_code == ErrorCode::NoPrintDataAvailable.as_u16())
        .collect();
    assert_eq!(no_data.len(), 1);
    assert!(no_data[0].is_error);
    // The error flag never leaks onto a later record
    let last = records.last().unwrap();
    assert!(!last.is_error);
    assert_eq!(last.error_code, ErrorCode::Success.as_u16());
}

#[tokio::test]
async fn print_data_download_lifecycle_updates_substate() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    write_bundle(&dir.path().join("download/job"), 2, None);

    let mut engine = Engine::without_hardware(settings.clone()).unwrap();
    let tx = engine.command_sender();
    let status_path = engine.status_pipe_path().to_path_buf();

    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(Ok(Command::Reset)).await.unwrap();
        tx.send(Ok(Command::StartPrintDataLoad)).await.unwrap();
        tx.send(Ok(Command::ProcessPrintData)).await.unwrap();
        tx.send(Ok(Command::Exit)).await.unwrap();
    });
    engine.run().await.unwrap();
    driver.await.unwrap();

    let records = read_records(&status_path);
    let subs: Vec<u8> = records.iter().map(|r| r.substate).collect();
    assert!(subs.contains(&(UiSubState::Downloading as u8)));
    assert!(subs.contains(&(UiSubState::Downloaded as u8)));
    // The bundle moved into place
    assert!(Path::new(&settings.paths.print_data_dir)
        .join("slice_1.png")
        .exists());
    assert!(!Path::new(&settings.paths.download_dir).join("job").exists());
}

#[tokio::test]
async fn starting_a_download_discards_the_staged_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    write_bundle(&dir.path().join("print"), 4, None);

    let mut engine = Engine::without_hardware(settings.clone()).unwrap();
    let tx = engine.command_sender();
    let status_path = engine.status_pipe_path().to_path_buf();

    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(Ok(Command::Reset)).await.unwrap();
        tx.send(Ok(Command::StartPrintDataLoad)).await.unwrap();
        tx.send(Ok(Command::Exit)).await.unwrap();
    });
    engine.run().await.unwrap();
    driver.await.unwrap();

    let records = read_records(&status_path);
    assert!(
        records
            .iter()
            .any(|r| r.substate == UiSubState::Downloading as u8)
    );
    // The staged bundle made way for the incoming one
    assert!(!Path::new(&settings.paths.print_data_dir).exists());
}

#[tokio::test]
async fn out_of_range_separation_rpms_warn_once_each_and_print_proceeds() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    // Limits default to 1..=11: both overrides are out of range
    write_bundle(
        &dir.path().join("print"),
        3,
        Some("burn_in_separation_rpm = 12\nmodel_separation_rpm = 15\n"),
    );

    let mut engine = Engine::without_hardware(settings).unwrap();
    let tx = engine.command_sender();
    let status_path = engine.status_pipe_path().to_path_buf();

    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(Ok(Command::Reset)).await.unwrap();
        tx.send(Ok(Command::Start)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(Ok(Command::Exit)).await.unwrap();
    });
    engine.run().await.unwrap();
    driver.await.unwrap();

    let records = read_records(&status_path);
    // Exactly two records carry the RPM warning, no third
    let rpm_errors: Vec<_> = records
        .iter()
        .filter(|r| r.error_code == ErrorCode::SeparationRpmOutOfRange.as_u16())
        .collect();
    assert_eq!(rpm_errors.len(), 2);
    assert!(rpm_errors.iter().all(|r| r.is_error));

    // The pipeline still started: from Idle the print homes first
    assert!(entered(&records).contains(&(StateCode::Homing as u8)));
    let homing = records
        .iter()
        .find(|r| r.state == StateCode::Homing as u8)
        .unwrap();
    assert_eq!(homing.num_layers, 3);
    assert_eq!(homing.current_layer, 0);
}

#[tokio::test]
async fn unknown_command_input_is_a_nonfatal_warning() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::without_hardware(test_settings(dir.path())).unwrap();
    let tx = engine.command_sender();
    let status_path = engine.status_pipe_path().to_path_buf();

    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(Err(UnknownCommand("frobnicate".into()))).await.unwrap();
        tx.send(Ok(Command::GetStatus)).await.unwrap();
        tx.send(Ok(Command::Exit)).await.unwrap();
    });
    engine.run().await.unwrap();
    driver.await.unwrap();

    let records = read_records(&status_path);
    let unknown: Vec<_> = records
        .iter()
        .filter(|r| r.error_code == ErrorCode::UnknownCommandInput.as_u16())
        .collect();
    assert_eq!(unknown.len(), 1);
    assert!(unknown[0].is_error);
    // GetStatus republished with the latch cleared
    assert!(!records.last().unwrap().is_error);
}
