use nalgebra::Matrix4;
use pyseg_core::catalog::{CatalogError, OutputCatalog, OutputSet, RunStatus, SetKind};
use pyseg_core::config::TomoAcquisition;
use pyseg_core::db::{open_db, open_db_in_memory};
use pyseg_core::model::{Coordinate3D, TomoMask, Tomogram};
use pyseg_core::protocol::{
    run_and_record, InputStaging, OutputRegistration, Protocol, ProtocolError, Step, StepSequence,
};
use pyseg_core::stages::StageError;
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn coordinate(x: f64, group: &str) -> Coordinate3D {
    let mut transform = Matrix4::identity();
    transform[(0, 3)] = x;
    Coordinate3D {
        x,
        y: 2.0,
        z: 3.0,
        transform,
        vol_id: Some(0),
        vol_name: "/data/tomo.mrc".to_string(),
        group_id: Some(group.to_string()),
    }
}

#[test]
fn registered_sets_round_trip_their_items() {
    let mut conn = open_db_in_memory().unwrap();
    let mut catalog = OutputCatalog::new(&mut conn);
    let run_id = catalog
        .begin_run("pyseg.picking", Path::new("/runs/1"), &serde_json::json!({"box_size": 20}))
        .unwrap();

    let coords = vec![coordinate(1.0, "4"), coordinate(5.5, "7")];
    let mut set = OutputSet::new("coordinates", SetKind::Coordinates, 13.68, &coords);
    set.box_size = Some(20);
    let set_id = catalog.register_set(run_id, &set).unwrap();

    assert_eq!(catalog.count_items(set_id).unwrap(), 2);
    let items = catalog.list_items(set_id).unwrap();
    assert_eq!(items, set.items);
    assert_eq!(items[1].transform.unwrap()[3], 5.5);
    assert_eq!(items[1].group_id.as_deref(), Some("7"));

    catalog
        .finish_run(run_id, RunStatus::Finished, Some("Particles picked = 2"))
        .unwrap();
    let run = catalog.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Finished);
    assert_eq!(run.summary.as_deref(), Some("Particles picked = 2"));
}

#[test]
fn set_names_are_unique_per_run() {
    let mut conn = open_db_in_memory().unwrap();
    let mut catalog = OutputCatalog::new(&mut conn);
    let run_id = catalog
        .begin_run("pyseg.preseg", Path::new("/runs/2"), &serde_json::json!({}))
        .unwrap();
    let masks = vec![TomoMask {
        file_name: "/runs/2/extra/t_tid_1_seg.mrc".to_string(),
        vol_name: "/runs/2/extra/t_tid_1.mrc".to_string(),
        class_id: Some(1),
        sampling_rate: 13.68,
    }];
    let set = OutputSet::new("segmentations", SetKind::TomoMasks, 13.68, &masks);
    catalog.register_set(run_id, &set).unwrap();

    let err = catalog.register_set(run_id, &set).unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateSet { ref name, .. } if name == "segmentations"));
    assert_eq!(catalog.list_sets(run_id).unwrap().len(), 1);
}

#[test]
fn sets_need_an_existing_run() {
    let mut conn = open_db_in_memory().unwrap();
    let mut catalog = OutputCatalog::new(&mut conn);
    let masks: Vec<TomoMask> = Vec::new();
    let set = OutputSet::new("empty", SetKind::TomoMasks, 1.0, &masks);
    let missing = Uuid::new_v4();
    assert!(matches!(
        catalog.register_set(missing, &set),
        Err(CatalogError::UnknownRun(id)) if id == missing
    ));
}

#[test]
fn tomogram_stack_index_has_its_own_column() {
    let mut conn = open_db_in_memory().unwrap();
    let mut catalog = OutputCatalog::new(&mut conn);
    let run_id = catalog
        .begin_run("pyseg.gfp", Path::new("/runs/3"), &serde_json::json!({}))
        .unwrap();
    let tomograms: Vec<Tomogram> = (1..=2)
        .map(|index| Tomogram {
            file_name: "/data/stack.em".to_string(),
            index,
            sampling_rate: 10.0,
            origin: [0.0; 3],
            acquisition: TomoAcquisition::default(),
        })
        .collect();
    let set = OutputSet::new("tomograms", SetKind::Tomograms, 10.0, &tomograms);
    let set_id = catalog.register_set(run_id, &set).unwrap();

    let items = catalog.list_items(set_id).unwrap();
    assert_eq!(items[0].stack_index, Some(1));
    assert_eq!(items[1].stack_index, Some(2));
    assert!(items.iter().all(|item| item.class_id.is_none()));
}

/// Fails its only step after removing its own run row, so recording the
/// failure fails too.
struct DropsRunThenFails {
    db_path: PathBuf,
}

impl InputStaging for DropsRunThenFails {
    fn stage_inputs(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

impl StepSequence for DropsRunThenFails {
    fn steps(&self) -> Vec<Step> {
        vec![Step::new("work")]
    }

    fn run_step(&mut self, _name: &str) -> Result<(), StageError> {
        let other = rusqlite::Connection::open(&self.db_path).unwrap();
        other.execute("DELETE FROM runs;", []).unwrap();
        Err(StageError::InvalidParams("work failed".to_string()))
    }
}

impl OutputRegistration for DropsRunThenFails {
    fn outputs(&self) -> Vec<OutputSet> {
        Vec::new()
    }
}

impl Protocol for DropsRunThenFails {
    fn protocol_id(&self) -> &'static str {
        "test.drops_run"
    }
}

#[test]
fn step_error_survives_a_failed_status_update() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("catalog.db");
    let mut conn = open_db(&db_path).unwrap();
    let mut catalog = OutputCatalog::new(&mut conn);
    let mut protocol = DropsRunThenFails { db_path };

    let err = run_and_record(&mut protocol, &mut catalog, dir.path(), &serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Step { ref step, .. } if step == "work"));
    assert!(err.to_string().contains("work failed"));
}
