mod common;

use common::{in_star, out_dir, stem, write_picking_table, FixedProbe, RecordingRunner};
use pyseg_core::catalog::SetKind;
use pyseg_core::protocol::run_protocol;
use pyseg_core::stages::{GfpParams, GfpStage, StageContext};
use pyseg_core::star::Table;
use pyseg_core::{JobSpec, PysegConfig};

fn fake_pyseg(spec: &JobSpec) {
    let script = &spec.args[0];
    let out = out_dir(spec);
    if script.ends_with("mb_graph_batch.py") {
        let name = format!("{}_mb_graph.star", stem(&in_star(spec)));
        Table::new(["rlnMicrographName"]).write(out.join(name)).unwrap();
    } else if script.ends_with("mb_fils_network.py") {
        Table::new(["rlnMicrographName"])
            .write(out.join("fil_mb_sources_to_no_mb_targets_net.star"))
            .unwrap();
    } else if script.ends_with("mb_picking.py") {
        write_picking_table(
            &out.join("fil_mb_sources_to_no_mb_targets_net_parts.star"),
            &[
                ("/data/tomo_b.mrc", "/data/tomo_b_tid_1.mrc", 1.0),
                ("/data/tomo_a.mrc", "/data/tomo_a_tid_7.mrc", 2.0),
                ("/data/tomo_a.mrc", "/data/tomo_a_tid_8.mrc", 3.0),
            ],
        );
    }
}

#[test]
fn gfp_chains_the_three_programs_and_builds_tomograms_from_the_picks() {
    let dir = tempfile::tempdir().unwrap();
    let config = PysegConfig::new(dir.path().join("pyseg"));
    let probe = FixedProbe::default()
        .with("/data/tomo_a.mrc", (100, 80, 40))
        .with("/data/tomo_b.mrc", (100, 80, 40));
    let runner = RecordingRunner::new(fake_pyseg);
    let work = dir.path().join("gfp");
    let ctx = StageContext::new(&work, &config, &runner, &probe);
    let params: GfpParams = serde_json::from_value(serde_json::json!({
        "in_star": dir.path().join("particles_pre.star"),
        "pixel_size": 20.0,
        "max_len": 15.0,
        "th_mode": "out"
    }))
    .unwrap();
    let mut stage = GfpStage::new(params, ctx).unwrap();
    let report = run_protocol(&mut stage).unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].flag_value("--pixelSize"), Some("2"));
    assert_eq!(calls[0].flag_value("--maxLen"), Some("15"));
    assert!(calls[0].flag_value("--outDir").unwrap().ends_with("extra/graphs"));
    assert!(calls[1]
        .flag_value("--inStar")
        .unwrap()
        .ends_with("extra/graphs/particles_pre_mb_graph.star"));
    assert_eq!(calls[1].flag_value("--thMode"), Some("out"));
    assert!(calls[2]
        .flag_value("--slicesFile")
        .unwrap()
        .ends_with("pick/in/mb_ext.xml"));

    assert_eq!(report.outputs.len(), 2);
    let tomograms = &report.outputs[0];
    assert_eq!(tomograms.kind, SetKind::Tomograms);
    let names: Vec<_> = tomograms.items.iter().map(|item| item.file_name.as_str()).collect();
    assert_eq!(names, vec!["/data/tomo_a.mrc", "/data/tomo_b.mrc"]);
    let coordinates = &report.outputs[1];
    assert_eq!(coordinates.kind, SetKind::Coordinates);
    assert_eq!(coordinates.items.len(), 3);
    assert_eq!(coordinates.sampling_rate, 20.0);
    assert_eq!(report.summary, vec!["Tomograms = 2, Particles picked = 3"]);
}
