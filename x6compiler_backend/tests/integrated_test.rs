use assert_matches::assert_matches;
use indexmap::IndexMap;
use ndarray::Array1;
use std::fs;
use std::path::PathBuf;

use x6compiler_backend::*;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("x6compiler_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn section_values(text: &str, section: &str) -> Vec<(String, String)> {
    let conf = ConfigFile::parse_str(text).unwrap();
    conf.options(section)
        .unwrap()
        .into_iter()
        .map(|key| {
            let value = conf.get(section, &key).unwrap().to_string();
            (key, value)
        })
        .collect()
}

#[test]
fn transmitter_pattern_file() {
    let dir = scratch_dir("tx_pattern");
    for (pulse_length, dead_time) in [(0, 0), (100, 515), (2000, 15)] {
        let path = gen_transmitter_pattern(&dir, pulse_length, dead_time).unwrap();
        assert_eq!(path.file_name().unwrap(), "transmitter.pattern");
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains(" = "));

        for section in ["Destination", "Delay", "Width"] {
            let values = section_values(&text, section);
            let keys: Vec<&str> = values.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, vec!["arraysize", "p0", "p1", "p2", "p3"]);
            assert_eq!(values[0].1, "4");
        }
        let width = section_values(&text, "Width");
        assert_eq!(width[2].1, (pulse_length + 1000).to_string());
        assert_eq!(width[3].1, pulse_length.to_string());
        assert_eq!(width[4].1, pulse_length.to_string());

        let pattern = PriPattern::read(&path).unwrap();
        assert_eq!(pattern, transmitter_pattern(pulse_length, dead_time));
        assert_eq!(pattern.pulse(0).unwrap(), PriPulse::new(1, 0, 20000));
        assert_eq!(pattern.pulse(2).unwrap(), PriPulse::new(33, 400, pulse_length));
        assert_eq!(pattern.pulse(3).unwrap(), PriPulse::new(512, 400, pulse_length));
    }
}

#[test]
fn transmitter_pattern_layout() {
    let expected = "[Destination]\nArraySize=4\nP0=1\nP1=64\nP2=33\nP3=512\n\n\
                    [Delay]\nArraySize=4\nP0=0\nP1=0\nP2=400\nP3=400\n\n\
                    [Width]\nArraySize=4\nP0=20000\nP1=1100\nP2=100\nP3=100\n";
    assert_eq!(transmitter_pattern(100, 515).to_string(), expected);
}

#[test]
fn receiver_and_nodigital_patterns() {
    let dir = scratch_dir("rx_pattern");
    let path = gen_receiver_pattern(&dir, 7, 2000).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    for section in ["Destination", "Delay", "Width"] {
        assert_eq!(section_values(&text, section)[0].1, "1");
    }
    assert_eq!(section_values(&text, "Delay")[1].1, "7");
    assert_eq!(section_values(&text, "Width")[1].1, "2000");

    let path = gen_transmitter_pattern_nodigital(&dir, 300, 15).unwrap();
    let pattern = PriPattern::read(&path).unwrap();
    assert_eq!(pattern.pulses(), &[PriPulse::new(33, 0, 300)]);
    assert_eq!(
        pattern.addressed_channels(0, false).unwrap(),
        vec!["DA0", "DA1", "DA2", "DA3"]
    );
}

#[test]
fn pattern_parsing_is_tolerant() {
    let text = "[Destination]\nArraySize = 2\nP0 = 0x21\nP1 = 0x200\n\n\
                [Delay]\nArraySize = 3\nP0 = 0\nP1 = 400\nP2 = 9\n\n\
                [Width]\nArraySize = 2\nP0 = 100\nP1 = 100\n";
    let pattern = PriPattern::parse_str(text).unwrap();
    assert_eq!(pattern.array_size(), 2);
    assert_eq!(pattern.pulse(1).unwrap(), PriPulse::new(0x200, 400, 100));

    let empty = PriPattern::parse_str("[Destination]\nArraySize=0\n").unwrap();
    assert_eq!(empty.array_size(), 0);

    let truncated = "[Destination]\nArraySize=2\nP0=1\n\n[Delay]\nArraySize=2\nP0=0\nP1=0\n\n\
                     [Width]\nArraySize=2\nP0=1\nP1=1\n";
    assert_matches!(PriPattern::parse_str(truncated), Err(Error::MissingKey { .. }));
}

#[test]
fn pulse_index_bounds() {
    let mut pattern = receiver_pattern(0, 10);
    pattern.set_pulse(0, 2, 3, 4).unwrap();
    assert_eq!(pattern.pulse(0).unwrap(), PriPulse::new(2, 3, 4));
    assert_matches!(
        pattern.set_pulse(1, 1, 1, 1),
        Err(Error::PulseIndex {
            index: 1,
            array_size: 1
        })
    );
    assert_matches!(pattern.pulse(5), Err(Error::PulseIndex { .. }));
}

#[test]
fn num_avgs_validation() {
    for bad in [0i64, -1] {
        assert_matches!(NumAvgs::try_from(bad), Err(Error::InvalidArgument(_)));
    }
    assert_matches!("abc".parse::<NumAvgs>(), Err(Error::InvalidArgument(_)));
    assert_matches!("".parse::<NumAvgs>(), Err(Error::InvalidArgument(_)));

    assert_eq!(NumAvgs::try_from(1i64).unwrap().get(), 1);
    assert_eq!(NumAvgs::try_from(5i64).unwrap().get(), 5);
    assert_eq!("5".parse::<NumAvgs>().unwrap().get(), 5);
    assert_matches!(NumAvgs::new(0), Err(Error::InvalidArgument(_)));

    assert_eq!(NumAvgs::from_f64(1.).unwrap(), NumAvgs::default());
    assert_eq!(NumAvgs::from_f64(5.9).unwrap().get(), 5);
    for bad in [0., 0.99, -1., f64::INFINITY, f64::NAN, 1e300] {
        assert_matches!(NumAvgs::from_f64(bad), Err(Error::InvalidArgument(_)));
    }
}

#[test]
fn output_naming() {
    let index = output_index(3, 2, 1);
    assert_eq!(index, 7);
    assert_eq!(output_file_name(index), "repetition-00007.npy");
    assert_eq!(output_file_name(0), "repetition-00000.npy");
}

#[test]
fn block_average_of_four_chunks() {
    let capture = Array1::from_iter((0..100).map(|v| v as f64));
    let (averaged, chunks) = block_average(&capture, NumAvgs::new(4).unwrap()).unwrap();
    assert_eq!(averaged.len(), 25);
    assert_eq!(chunks.dim(), (4, 25));

    let subtracted = baseline_subtract(&capture);
    for j in 0..25 {
        let manual = (0..4).map(|k| subtracted[k * 25 + j]).sum::<f64>() / 4.;
        assert!((averaged[j] - manual).abs() < 1e-12);
        assert!((averaged[j] - (j as f64 - 12.)).abs() < 1e-12);
    }

    let short = Array1::from_vec(vec![1., 2.]);
    assert_matches!(
        block_average(&short, NumAvgs::new(4).unwrap()),
        Err(Error::InvalidArgument(_))
    );
    let (odd, _) = block_average(&Array1::from_vec(vec![1., 1., 1., 1., 9.]), NumAvgs::new(2).unwrap()).unwrap();
    assert_eq!(odd.len(), 2);
}

#[test]
fn board_settings_from_preset() {
    let text = "\
[DEFAULT]
sample_rate = 1000
tx_active_channels = True, False, True, False
rx_count = 1
alert_enable = True, True

# presets
[Single Pulse]
rx_count = 0x10 ; sixteen
TX_Period = 20000
tx_enable_pri: False
debug_verbosity = 2
";
    let conf = ConfigFile::parse_str(text).unwrap();
    assert_eq!(conf.sections().collect::<Vec<_>>(), vec!["Single Pulse"]);

    let mut settings = BoardSettings::default();
    settings.apply(&conf, "Single Pulse").unwrap();
    assert_eq!(settings.rx_pri.count, 16);
    assert_eq!(settings.tx_pri.period, 20000);
    assert!(!settings.tx_pri.enable);
    assert_eq!(settings.common.sample_rate, 1000.);
    assert_eq!(settings.common.debug_verbosity, 2);
    assert_eq!(settings.common.alert_enable.len(), 7);
    assert_eq!(settings.tx_active_channels(), [true, false, true, false]);
    settings.validate().unwrap();

    assert_matches!(
        settings.apply(&conf, "Double Pulse"),
        Err(Error::MissingSection { .. })
    );
    assert_matches!(conf.get("Single Pulse", "rx_period"), Err(Error::MissingKey { .. }));
    assert_matches!(
        ConfigFile::parse_str("[S]\ntx_finite = maybe\n").unwrap().get_bool("S", "tx_finite"),
        Err(Error::Parse { .. })
    );
}

#[test]
fn board_settings_save_and_load() {
    let dir = scratch_dir("settings");
    gen_transmitter_pattern(&dir, 100, 15).unwrap();
    gen_receiver_pattern(&dir, 0, 2000).unwrap();
    let conf_file = dir.join("standard_configurations.pulse");
    fs::write(
        &conf_file,
        "[Single Pulse]\n\
         tx_enable_pri = True\ntx_pattern_file = transmitter.pattern\n\
         rx_enable_pri = True\nrx_pattern_file = receiver.pattern\n\
         tx_active_channels = True, False, True, False\nsample_rate = 1000\n",
    )
    .unwrap();

    let mut settings = BoardSettings::load(&conf_file, "Single Pulse").unwrap();
    assert_eq!(
        settings.tx_pri.pattern_file.as_deref(),
        Some(dir.join("transmitter.pattern").as_path())
    );
    settings.validate().unwrap();

    settings.tx_pri.count = 8;
    settings.save(&conf_file, "Copy").unwrap();
    let reloaded = BoardSettings::load(&conf_file, "Copy").unwrap();
    assert_eq!(reloaded, settings);
    assert_eq!(
        BoardSettings::load(&conf_file, "Single Pulse").unwrap().tx_pri.count,
        0
    );

    fs::remove_file(dir.join("receiver.pattern")).unwrap();
    assert_matches!(settings.validate(), Err(Error::Io(_)));
}

#[test]
fn strip_spaces_in_place() {
    let dir = scratch_dir("strip");
    let path = dir.join("spaced.pattern");
    fs::write(&path, "[Width]\nArraySize = 1\nP0 =  20\n").unwrap();
    strip_spaces_from_ini(&path).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "[Width]\nArraySize=1\nP0=20\n");
}

#[test]
fn velo_stream_round_trip() {
    let dir = scratch_dir("velo");
    let velo_file = dir.join("capture.bin");
    let samples_per_packet = VITA_PACKET_SIZE / 2;
    let long: Vec<i16> = (0..2 * samples_per_packet + 7)
        .map(|i| (i % 30_000) as i16 - 15_000)
        .collect();
    let short: Vec<i16> = vec![-1, 0, 1, i16::MAX, i16::MIN];

    let mut streams = IndexMap::new();
    streams.insert("0x100".to_string(), long.clone());
    streams.insert("0x101".to_string(), short.clone());
    rawbin_to_velo(&velo_file, &streams, 3).unwrap();

    let parsed = parse_velo_stream(&velo_file).unwrap();
    assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["0x100", "0x101"]);
    assert_eq!(parsed["0x100"], long);
    assert_eq!(parsed["0x101"], short);

    let bytes = fs::read(&velo_file).unwrap();
    assert_eq!(VeloHeader::from_bytes(&bytes).unwrap().peripheral_id, 3);
    assert_matches!(parse_velo_bytes(&bytes[..10]), Err(Error::Stream(_)));
}

#[test]
fn waveform_round_trip() {
    let dir = scratch_dir("waveform");
    let velo_file = dir.join("waveform.velo");
    let active = [true, true, true, true];
    let waveforms = [Some(vec![1, 2, 3]), Some(vec![4, 5]), None, Some(vec![7])];
    assert!(waveform_to_velo(&active, &velo_file, &waveforms, 0).unwrap());

    let read = velo_to_waveform(&active, &velo_file).unwrap();
    let half = MINIMUM_DATA_SIZE / 2;
    for waveform in &read {
        assert_eq!(waveform.as_ref().unwrap().len(), half);
    }
    assert_eq!(&read[0].as_ref().unwrap()[..4], &[1, 2, 3, 0]);
    assert_eq!(&read[1].as_ref().unwrap()[..3], &[4, 5, 0]);
    assert!(read[2].as_ref().unwrap().iter().all(|&v| v == 0));
    assert_eq!(read[3].as_ref().unwrap()[0], 7);

    let empty = dir.join("empty.velo");
    assert!(!waveform_to_velo(&active, &empty, &Default::default(), 0).unwrap());
    assert!(!empty.exists());
}

#[test]
fn single_pulse_waveform() {
    let dir = scratch_dir("single_pulse");
    let velo_file = dir.join(SINGLE_PULSE_FILE);
    let (i, q) = gen_velo_single_pulse(&velo_file, 100, 0., 0., 0.5, 2).unwrap();
    assert_eq!(i.len(), 100);
    assert_eq!(q.len(), 100);
    // sin(0) and cos(0)
    assert_eq!(i[0], 0);
    assert_eq!(q[0], (0.5 * 32767.) as i16);
    // 200 MHz at 1 ns steps: period of 5 samples
    assert_eq!(i[5], i[0]);
    assert!(i.iter().chain(q.iter()).all(|v| v.abs() <= 16384));

    let read = velo_to_waveform(&[true, false, true, false], &velo_file).unwrap();
    assert_eq!(&read[0].as_ref().unwrap()[..100], &i[..]);
    assert_eq!(&read[0].as_ref().unwrap()[100..200], &i[..]);
    assert_eq!(&read[2].as_ref().unwrap()[..100], &q[..]);
    assert!(read[1].is_none() && read[3].is_none());
}

#[test]
fn waveforms_from_npy_and_npz_files() {
    let dir = scratch_dir("waveform_files");
    let i_file = dir.join("i.npy");
    ndarray_npy::write_npy(&i_file, &Array1::from_vec(vec![0.5, -0.5, 0.25])).unwrap();
    let q_file = dir.join("q.npz");
    let mut npz = ndarray_npy::NpzWriter::new(fs::File::create(&q_file).unwrap());
    npz.add_array("r", &Array1::from_vec(vec![0.25, 0.])).unwrap();
    npz.add_array("other", &Array1::from_vec(vec![1.])).unwrap();
    npz.finish().unwrap();

    assert_eq!(load_waveform_file(&q_file, "r").unwrap().to_vec(), vec![0.25, 0.]);
    assert!(load_waveform_file(&q_file, "missing").is_err());

    let velo_file = dir.join(SINGLE_PULSE_FILE);
    let (i, q) = gen_velo_from_files(&velo_file, &i_file, &q_file, "r", true).unwrap();
    assert_eq!(i, vec![32767, -32767, 16383]);
    assert_eq!(q, vec![16383, 0]);
    let read = velo_to_waveform(&[true, false, true, false], &velo_file).unwrap();
    assert_eq!(&read[0].as_ref().unwrap()[..3], &i[..]);
    assert_eq!(&read[2].as_ref().unwrap()[..2], &q[..]);

    let mat_file = dir.join("rand_data_1.mat");
    fs::write(&mat_file, b"MATLAB 5.0 MAT-file").unwrap();
    assert_matches!(
        gen_velo_from_files(&velo_file, &mat_file, &mat_file, "r", false),
        Err(Error::InvalidArgument(_))
    );
}

#[test]
fn pattern_timelines() {
    let tx = transmitter_pattern(100, 515);
    let rx = receiver_pattern(5, 10);
    let waveforms = [Some(vec![i16::MAX; 50]), None, None, None];
    let lines = pri_pattern_to_lines(&[true, false, true, false], Some(&rx), Some(&tx), &waveforms, true);
    assert_eq!(
        lines.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["AD0", "AD1", "DA0", "DA2", "DAC1_DIO0", "DAC1_DIO3"]
    );

    assert_eq!(lines["AD0"].len(), 14);
    assert_eq!(lines["AD0"].sum(), 10.);
    assert_eq!(lines["AD0"][3], 0.);
    assert_eq!(lines["AD0"][4], 1.);

    let da0 = &lines["DA0"];
    assert_eq!(da0.len(), 20000);
    assert!(da0.slice(ndarray::s![..50]).iter().all(|&v| v == 1.));
    assert!(da0.slice(ndarray::s![50..]).iter().all(|&v| v == 0.));

    assert_eq!(lines["DA2"].len(), 499);
    assert_eq!(lines["DA2"].sum(), 100.);
    assert_eq!(lines["DAC1_DIO0"].len(), 1100);
    assert_eq!(lines["DAC1_DIO0"].sum(), 1100.);
    assert_eq!(lines["DAC1_DIO3"].sum(), 100.);

    let axis = time_axis(1000., da0.len());
    assert_eq!(axis.unit, "us");
    let (low, high) = y_limits(da0);
    assert!(low < 0. && high > 1.);
}
