//! Walk two property office forms through their sign-offs.
//!
//! Run with `RUST_LOG=debug` to see the engine's own log lines next to the
//! event sink's.

use form_approval::{
    Actor, ApprovalService, FormType, StatusSyncTarget, StepColumnMap, Subject, SubjectRegistry,
    SyncOutcome,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, minicbor::Encode, minicbor::Decode)]
struct InventorySchedule {
    #[n(0)]
    building: String,
    #[n(1)]
    noted_by: Option<String>,
    #[n(2)]
    approved_by: Option<String>,
    #[n(3)]
    status: String,
}

impl StepColumnMap for InventorySchedule {
    fn step_code_to_column(&self) -> &[(&'static str, &'static str)] {
        &[("noted_by", "noted_by"), ("approved_by", "approved_by")]
    }

    fn sync_field(&mut self, column: &str, value: Option<&str>) -> anyhow::Result<()> {
        let slot = match column {
            "noted_by" => &mut self.noted_by,
            "approved_by" => &mut self.approved_by,
            other => anyhow::bail!("no column `{other}`"),
        };
        *slot = value.map(str::to_string);
        Ok(())
    }
}

impl Subject for InventorySchedule {
    const SUBJECT_TYPE: &'static str = "inventory_schedule";

    fn step_columns(&mut self) -> Option<&mut dyn StepColumnMap> {
        Some(self)
    }
}

impl StatusSyncTarget for InventorySchedule {
    fn sync_approval_status(&mut self, outcome: SyncOutcome) {
        self.status = match outcome {
            SyncOutcome::Reset => "Pending_Review",
            SyncOutcome::Rejected => "Cancelled",
            SyncOutcome::Approved => "Pending",
        }
        .to_string();
    }
}

#[derive(Debug, Default, minicbor::Encode, minicbor::Decode)]
struct AssetTransfer {
    #[n(0)]
    asset_tag: String,
    #[n(1)]
    approved_by_name: Option<String>,
    #[n(2)]
    status: String,
}

impl StepColumnMap for AssetTransfer {
    fn step_code_to_column(&self) -> &[(&'static str, &'static str)] {
        &[("approved_by", "approved_by_name")]
    }

    fn sync_field(&mut self, column: &str, value: Option<&str>) -> anyhow::Result<()> {
        anyhow::ensure!(column == "approved_by_name", "no column `{column}`");
        self.approved_by_name = value.map(str::to_string);
        Ok(())
    }
}

impl Subject for AssetTransfer {
    const SUBJECT_TYPE: &'static str = "asset_transfer";

    fn step_columns(&mut self) -> Option<&mut dyn StepColumnMap> {
        Some(self)
    }
}

impl StatusSyncTarget for AssetTransfer {
    fn sync_approval_status(&mut self, outcome: SyncOutcome) {
        self.status = match outcome {
            SyncOutcome::Reset => "pending_review",
            SyncOutcome::Rejected => "cancelled",
            SyncOutcome::Approved => "upcoming",
        }
        .to_string();
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("workflow.db"))?);
    let registry = SubjectRegistry::new()
        .register_synced::<InventorySchedule>()
        .register_synced::<AssetTransfer>();
    let service = ApprovalService::new(db, registry)?;

    let custodian = Actor::new("staff-001", "Ada Property Custodian");
    let supervisor = Actor::new("staff-002", "Grace Unit Supervisor");
    let director = Actor::new("staff-003", "Alan Property Director");

    // inventory schedule: noted, approved, then rolled back one step
    let schedule = InventorySchedule {
        building: "Engineering Hall".into(),
        status: "Draft".into(),
        ..Default::default()
    };
    let ctx = service.open_request(
        "sched-2026-01",
        &schedule,
        &custodian,
        FormType::InventoryScheduling,
        "Annual inventory, Engineering Hall",
    )?;
    let schedule_id = ctx.request.id.clone();

    service.approve_current_step(&schedule_id, &supervisor, Some("noted".into()))?;
    let ctx = service.approve_current_step(&schedule_id, &director, None)?;
    println!("{} is {}", ctx.request.form_title, ctx.status().as_str());

    let ctx = service.reset_to_pending(&schedule_id, Some(3))?;
    println!(
        "after reset {} waits on {:?}",
        ctx.status().as_str(),
        ctx.current_step().map(|s| s.label.as_str())
    );
    if let Some(subject) = service.load_subject::<InventorySchedule>("sched-2026-01")? {
        println!("schedule subject now {subject:?}");
    }

    // asset transfer: rejected by the director
    let transfer = AssetTransfer {
        asset_tag: "PROJ-0042".into(),
        status: "draft".into(),
        ..Default::default()
    };
    let ctx = service.open_request(
        "tr-0042",
        &transfer,
        &custodian,
        FormType::Transfer,
        "Projector to Library",
    )?;
    let ctx = service.reject_current_step(
        &ctx.request.id,
        &director,
        Some("asset is on loan".into()),
    )?;
    println!("{} is {}", ctx.request.form_title, ctx.status().as_str());
    if let Some(subject) = service.load_subject::<AssetTransfer>("tr-0042")? {
        println!("transfer subject now {subject:?}");
    }

    Ok(())
}
