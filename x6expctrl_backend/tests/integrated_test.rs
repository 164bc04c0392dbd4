use assert_matches::assert_matches;
use indexmap::IndexMap;
use ndarray::Array1;
use ndarray_npy::read_npy;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use x6compiler_backend::{
    gen_receiver_pattern, rawbin_to_velo, receiver_pattern, transmitter_pattern, velo_to_waveform, BoardSettings,
    NumAvgs, PriPattern,
};
use x6expctrl_backend::*;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("x6expctrl_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

const SINGLE_PULSE_PRESET: &str = "\
[DEFAULT]
sample_rate = 1000
rx_count = 1
tx_count = 1

[Single Pulse]
tx_enable_pri = True
tx_pattern_file = transmitter.pattern
rx_enable_pri = True
rx_pattern_file = receiver.pattern
tx_active_channels = True, False, True, False
rx_active_channels = True, False, False, False
tx_play_from_file_enable = True
tx_play_from_file_filename = single_pulse.velo
";

const RECEIVER_ONLY_PRESET: &str = "\
[Receive]
rx_enable_pri = True
rx_pattern_file = receiver.pattern
rx_active_channels = True, False, False, False
";

/// Records every call and serves a fixed capture on stream 0x100.
struct MockX6 {
    settings: BoardSettings,
    capture_file: PathBuf,
    capture: Vec<i16>,
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_on_start: bool,
    is_open: bool,
    is_streaming: bool,
}

impl MockX6 {
    fn new(capture_file: &Path, capture: Vec<i16>) -> Self {
        Self {
            settings: BoardSettings::default(),
            capture_file: capture_file.to_path_buf(),
            capture,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on_start: false,
            is_open: false,
            is_streaming: false,
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

impl X6Driver for MockX6 {
    fn settings(&self) -> &BoardSettings {
        &self.settings
    }
    fn is_open(&self) -> bool {
        self.is_open
    }
    fn is_streaming(&self) -> bool {
        self.is_streaming
    }
    fn settings_(&mut self) -> &mut BoardSettings {
        &mut self.settings
    }

    fn open(&mut self) -> Result<()> {
        self.calls.lock().push("open");
        self.is_open = true;
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        self.calls.lock().push("close");
        self.is_open = false;
        self.is_streaming = false;
        Ok(())
    }
    fn load_configuration(&mut self, _conf_file: &Path, _section: &str) -> Result<()> {
        self.calls.lock().push("load_configuration");
        Ok(())
    }
    fn preconfigure(&mut self) -> Result<()> {
        self.calls.lock().push("preconfigure");
        Ok(())
    }
    fn start_streaming(&mut self) -> Result<()> {
        self.calls.lock().push("start_streaming");
        if self.fail_on_start {
            return Err(Error::Device("DMA channel unavailable".to_string()));
        }
        self.is_streaming = true;
        Ok(())
    }
    fn stop_streaming(&mut self) -> Result<()> {
        self.calls.lock().push("stop_streaming");
        self.is_streaming = false;
        let mut streams = IndexMap::new();
        streams.insert("0x100".to_string(), self.capture.clone());
        rawbin_to_velo(&self.capture_file, &streams, 0)?;
        Ok(())
    }
}

fn mock_acq_config(dir: &Path) -> AcqConfig {
    AcqConfig {
        pulse_file: dir.join("standard_configurations.pulse"),
        pulse_name: "Single Pulse".to_string(),
        capture_file: dir.join("Data.bin"),
        data_stream: "0x100".to_string(),
        timing: AcqTiming::immediate(),
    }
}

#[test]
fn num_avgs_rejected_before_any_device_call() {
    let dir = scratch_dir("reject");
    let config = mock_acq_config(&dir);
    let mut device = MockX6::new(&config.capture_file, vec![1, 2, 3]);

    assert_matches!(
        run_acq(&mut device, &config, 1, 0i64, 0.),
        Err(Error::Backend(x6compiler_backend::Error::InvalidArgument(_)))
    );
    assert_matches!(
        run_acq(&mut device, &config, 1, -1i64, 0.),
        Err(Error::Backend(x6compiler_backend::Error::InvalidArgument(_)))
    );
    assert_matches!(
        run_acq(&mut device, &config, 1, "abc", 0.),
        Err(Error::Backend(x6compiler_backend::Error::InvalidArgument(_)))
    );
    assert_matches!(
        run_acq(&mut device, &config, 0, 1i64, 0.),
        Err(Error::InvalidArgument(_))
    );
    assert_matches!(
        run_acq(&mut device, &config, 1, 1i64, -1.),
        Err(Error::InvalidArgument(_))
    );
    assert!(device.calls().is_empty());
}

#[test]
fn run_acq_sets_registers_and_returns_capture() {
    let dir = scratch_dir("mock_acq");
    let config = mock_acq_config(&dir);
    let capture: Vec<i16> = (0..5000).map(|k| (k % 300) as i16 - 150).collect();

    for num_avgs in [1i64, 5] {
        let mut device = MockX6::new(&config.capture_file, capture.clone());
        let data = run_acq(&mut device, &config, 1, num_avgs, 0.002).unwrap();
        assert_eq!(data.to_vec(), capture);
        assert_eq!(device.settings().tx_pri.count, num_avgs as u32);
        assert_eq!(device.settings().rx_pri.count, num_avgs as u32);
        assert_eq!(device.settings().tx_pri.period, 2_000_000);
        assert_eq!(device.settings().rx_pri.period, 2_000_000);
        assert_eq!(
            device.calls(),
            vec![
                "open",
                "load_configuration",
                "preconfigure",
                "start_streaming",
                "stop_streaming",
                "close"
            ]
        );
    }

    let mut device = MockX6::new(&config.capture_file, capture.clone());
    run_acq(&mut device, &config, 1, "5", 1.).unwrap();
    assert_eq!(device.settings().rx_pri.count, 5);
    run_acq(&mut device, &config, 1, NumAvgs::new(3).unwrap(), 1.).unwrap();
    assert_eq!(device.settings().tx_pri.count, 3);
}

#[test]
fn device_closed_when_streaming_fails() {
    let dir = scratch_dir("failing");
    let config = mock_acq_config(&dir);
    let mut device = MockX6::new(&config.capture_file, vec![0; 16]);
    device.fail_on_start = true;

    assert_matches!(run_acq(&mut device, &config, 3, 2i64, 0.), Err(Error::Device(_)));
    assert!(!device.is_open());
    assert_eq!(device.calls().last(), Some(&"close"));
    assert_eq!(
        device.calls().iter().filter(|&&c| c == "start_streaming").count(),
        1
    );
}

#[test]
fn only_the_last_repetition_is_returned() {
    let dir = scratch_dir("repetitions");
    gen_receiver_pattern(&dir, 0, 100).unwrap();
    let conf_file = dir.join("receive.pulse");
    fs::write(&conf_file, RECEIVER_ONLY_PRESET).unwrap();
    let config = AcqConfig {
        pulse_file: conf_file,
        pulse_name: "Receive".to_string(),
        capture_file: dir.join("Data.bin"),
        data_stream: "0x100".to_string(),
        timing: AcqTiming::immediate(),
    };
    let mut device = SimulatedX6::new(&config.capture_file);

    let data = run_acq(&mut device, &config, 3, 4i64, 0.).unwrap();
    assert_eq!(data.len(), 4 * 100);
    assert_eq!(data[0], data[100]);
    assert!(!device.is_open());
    assert_eq!(
        device.events(),
        vec![
            DeviceEvent::Open,
            DeviceEvent::LoadConfiguration {
                section: "Receive".to_string()
            },
            DeviceEvent::Preconfigure,
            DeviceEvent::StartStreaming,
            DeviceEvent::StopStreaming,
            DeviceEvent::StartStreaming,
            DeviceEvent::StopStreaming,
            DeviceEvent::StartStreaming,
            DeviceEvent::StopStreaming,
            DeviceEvent::Close,
        ]
    );

    let missing = AcqConfig {
        data_stream: "0x101".to_string(),
        ..config
    };
    assert_matches!(
        run_acq(&mut device, &missing, 1, 1i64, 0.),
        Err(Error::Backend(x6compiler_backend::Error::MissingStream(_)))
    );
    assert!(!device.is_open());
    assert_eq!(device.events().last(), Some(&DeviceEvent::Close));

    let unknown = AcqConfig {
        pulse_name: "Double Pulse".to_string(),
        ..missing
    };
    assert_matches!(
        run_acq(&mut device, &unknown, 1, 1i64, 0.),
        Err(Error::Backend(x6compiler_backend::Error::MissingSection { .. }))
    );
    assert!(!device.is_open());
}

#[test]
fn sweep_over_two_by_two_grid() {
    let dir = scratch_dir("sweep");
    let preset_dir = dir.join("presets");
    fs::create_dir_all(&preset_dir).unwrap();
    fs::write(preset_dir.join("standard_configurations.pulse"), SINGLE_PULSE_PRESET).unwrap();
    let config = ExptConfig {
        pulse_file: preset_dir.join("standard_configurations.pulse"),
        output_dir: dir.join("out"),
        capture_file: dir.join("Data.bin"),
        ..ExptConfig::default()
    }
    .without_pacing();
    let mut device = SimulatedX6::new(&config.capture_path());

    let params = SweepParams {
        num_avgs: NumAvgs::new(2).unwrap(),
        rep_time_sec: 0.,
        ..SweepParams::new(vec![0.25, 0.5], vec![100, 200])
    };
    let result = run_expt(&mut device, &config, &params).unwrap();

    let names: Vec<String> = result
        .files
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "repetition-00000.npy",
            "repetition-00001.npy",
            "repetition-00002.npy",
            "repetition-00003.npy"
        ]
    );
    let mut on_disk: Vec<_> = fs::read_dir(dir.join("out"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    on_disk.sort();
    assert_eq!(on_disk.len(), 4);

    assert_eq!(result.raw.len(), 2 * 2000);
    assert_eq!(result.chunks.dim(), (2, 2000));
    assert_eq!(result.averaged.len(), 2000);
    assert!(result.averaged[0] > 7000.);
    let saved: Array1<f64> = read_npy(&result.files[3]).unwrap();
    assert_eq!(saved, result.averaged);

    // Patterns and playback file describe the last grid point
    let tx = PriPattern::read(&preset_dir.join("transmitter.pattern")).unwrap();
    assert_eq!(tx, transmitter_pattern(200, 515));
    let rx = PriPattern::read(&preset_dir.join("receiver.pattern")).unwrap();
    assert_eq!(rx.pulse(0).unwrap().width, 2000);
    let velo = preset_dir.join("single_pulse.velo");
    assert_eq!(config.preset_files().unwrap().velo, velo);
    let waveforms = velo_to_waveform(&[true, false, true, false], &velo).unwrap();
    let peak = waveforms[0]
        .as_ref()
        .unwrap()
        .iter()
        .map(|v| (*v as i32).abs())
        .max()
        .unwrap();
    assert!(peak > 13_000 && peak <= 16_384);

    let opens = device
        .events()
        .iter()
        .filter(|e| **e == DeviceEvent::Open)
        .count();
    assert_eq!(opens, 4);
    assert!(!device.is_open());
}

#[test]
fn empty_sweep_is_rejected() {
    let dir = scratch_dir("empty_sweep");
    let config = ExptConfig {
        pulse_file: dir.join("standard_configurations.pulse"),
        output_dir: dir.join("out"),
        capture_file: dir.join("Data.bin"),
        ..ExptConfig::default()
    };
    let mut device = SimulatedX6::new(&config.capture_path());
    assert_matches!(
        run_expt(&mut device, &config, &SweepParams::new(vec![], vec![100])),
        Err(Error::InvalidArgument(_))
    );
    assert!(device.events().is_empty());
}

#[test]
fn run_configuration_from_toml() {
    let dir = scratch_dir("toml");
    let path = dir.join("sweep.toml");
    fs::write(
        &path,
        r#"
pulse_name = "Echo"
output_dir = "/data/echo"
transmitter = "no_digital"
settle_stop_sec = 0.25

[waveform]
kind = "from_files"
i_file = "i.npy"
q_file = "q.npz"
volt_units = true
"#,
    )
    .unwrap();

    let config = ExptConfig::from_file(&path).unwrap();
    assert_eq!(config.pulse_name, "Echo");
    assert_eq!(config.output_dir, PathBuf::from("/data/echo"));
    assert_eq!(config.pulse_file, dir.join("standard_configurations.pulse"));
    // The board's logger writes the capture in the current directory
    assert_eq!(config.capture_path(), PathBuf::from("Data.bin"));
    assert_eq!(config.transmitter, TransmitterVariant::NoDigital);
    assert_eq!(
        config.waveform,
        WaveformSource::FromFiles {
            i_file: dir.join("i.npy"),
            q_file: dir.join("q.npz"),
            var_name: "r".to_string(),
            volt_units: true
        }
    );
    let timing = config.timing().unwrap();
    assert_eq!(timing.settle_stop.as_millis(), 250);
    assert_eq!(timing.calibrate.as_secs(), 2);

    assert_matches!(
        ExptConfig::parse_str("acq_time = \"long\""),
        Err(Error::Config(_))
    );
    let negative = ExptConfig {
        calibrate_sec: -1.,
        ..ExptConfig::default()
    };
    assert_matches!(negative.acq_config(), Err(Error::InvalidArgument(_)));
}

const NESTED_PRESET: &str = "\
[DEFAULT]
sample_rate = 1000

[Single Pulse]
tx_enable_pri = True
tx_pattern_file = patterns/transmitter.pattern
rx_enable_pri = True
rx_pattern_file = patterns/receiver.pattern
tx_active_channels = True, False, True, False
rx_active_channels = True, False, False, False
tx_play_from_file_enable = True
tx_play_from_file_filename = waves/single_pulse.velo
";

#[test]
fn sweep_writes_where_the_preset_reads() {
    let dir = scratch_dir("preset_paths");
    let preset_dir = dir.join("presets");
    fs::create_dir_all(preset_dir.join("patterns")).unwrap();
    fs::write(preset_dir.join("standard_configurations.pulse"), NESTED_PRESET).unwrap();
    // Left over from an earlier run with a much shorter window
    receiver_pattern(0, 7)
        .write(&preset_dir.join("patterns").join("receiver.pattern"))
        .unwrap();
    let path = dir.join("sweep.toml");
    fs::write(
        &path,
        format!(
            "pulse_file = \"presets/standard_configurations.pulse\"\n\
             output_dir = \"out\"\n\
             capture_file = {:?}\n",
            dir.join("Data.bin").display().to_string()
        ),
    )
    .unwrap();
    let config = ExptConfig::from_file(&path).unwrap().without_pacing();
    assert_eq!(
        config.preset_files().unwrap(),
        PresetFiles {
            tx_pattern: preset_dir.join("patterns").join("transmitter.pattern"),
            rx_pattern: preset_dir.join("patterns").join("receiver.pattern"),
            velo: preset_dir.join("waves").join("single_pulse.velo"),
        }
    );

    let mut device = SimulatedX6::new(&config.capture_path());
    let params = SweepParams {
        rep_time_sec: 0.,
        ..SweepParams::new(vec![0.5], vec![150])
    };
    let result = run_expt(&mut device, &config, &params).unwrap();

    // The board consumed the fresh receiver window, not the stale one
    assert_eq!(result.raw.len(), 2000);
    let rx = PriPattern::read(&preset_dir.join("patterns").join("receiver.pattern")).unwrap();
    assert_eq!(rx.pulse(0).unwrap().width, 2000);
    let tx = PriPattern::read(&preset_dir.join("patterns").join("transmitter.pattern")).unwrap();
    assert_eq!(tx, transmitter_pattern(150, 515));
    assert!(preset_dir.join("waves").join("single_pulse.velo").is_file());
    assert_eq!(result.files, vec![dir.join("out").join("repetition-00000.npy")]);
    assert!(!dir.join("transmitter.pattern").exists());
    assert!(!device.is_open());
}

#[test]
fn preset_files_default_to_the_pulse_file_directory() {
    let dir = scratch_dir("preset_defaults");
    fs::write(dir.join("receive.pulse"), RECEIVER_ONLY_PRESET).unwrap();
    let config = ExptConfig {
        pulse_file: dir.join("receive.pulse"),
        pulse_name: "Receive".to_string(),
        ..ExptConfig::default()
    };
    let files = config.preset_files().unwrap();
    assert_eq!(files.rx_pattern, dir.join("receiver.pattern"));
    assert_eq!(files.tx_pattern, dir.join("transmitter.pattern"));
    assert_eq!(files.velo, dir.join("single_pulse.velo"));

    let missing = ExptConfig {
        pulse_name: "Echo".to_string(),
        ..config
    };
    assert_matches!(
        missing.write_patterns(100, 515),
        Err(Error::Backend(x6compiler_backend::Error::MissingSection { .. }))
    );
    assert!(!dir.join("receiver.pattern").exists());
}

#[test]
fn no_digital_transmitter_variant() {
    let dir = scratch_dir("no_digital");
    fs::write(dir.join("standard_configurations.pulse"), SINGLE_PULSE_PRESET).unwrap();
    let config = ExptConfig {
        pulse_file: dir.join("standard_configurations.pulse"),
        transmitter: TransmitterVariant::NoDigital,
        receiver_delay: 50,
        acq_time: 1500,
        ..ExptConfig::default()
    };
    let (tx, rx) = config.write_patterns(300, 515).unwrap();
    assert_eq!(tx, dir.join("transmitter.pattern"));
    let tx = PriPattern::read(&tx).unwrap();
    assert_eq!(tx.array_size(), 1);
    assert_eq!(tx.pulse(0).unwrap().width, 300);
    let rx = PriPattern::read(&rx).unwrap();
    assert_eq!((rx.pulse(0).unwrap().delay, rx.pulse(0).unwrap().width), (50, 1500));
}

#[test]
fn configuration_timeline_plot() {
    let dir = scratch_dir("plot");
    fs::write(dir.join("standard_configurations.pulse"), SINGLE_PULSE_PRESET).unwrap();
    let config = ExptConfig {
        pulse_file: dir.join("standard_configurations.pulse"),
        ..ExptConfig::default()
    };
    config.write_patterns(100, 515).unwrap();
    config.write_waveform(100, 0.5, 0., NumAvgs::new(1).unwrap()).unwrap();

    let (lines, sample_rate) =
        configuration_lines(&config.pulse_file, "Single Pulse", true).unwrap();
    assert_eq!(sample_rate, 1000.);
    assert!(lines.contains_key("AD0"));
    assert!(lines.contains_key("DA0"));
    assert!(lines.contains_key("DA2"));
    assert!(!lines.contains_key("DA1"));
    assert_eq!(lines["AD0"].len(), 2000);
    assert!(lines["DA0"].iter().all(|v| v.abs() <= 0.5 + 1e-9));

    let out = dir.join("pulse.png");
    plot_configuration_file(&config.pulse_file, "Single Pulse", &out, true).unwrap();
    assert!(out.is_file());
    let folder_out = dir.join("folder.png");
    let used = plot_compiled_folder(&dir, "Single Pulse", &folder_out).unwrap();
    assert_eq!(used, config.pulse_file);
    assert!(folder_out.is_file());

    let trace_out = dir.join("trace.png");
    plot_trace(&trace_out, &Array1::linspace(-1., 1., 500)).unwrap();
    assert!(trace_out.is_file());
}
