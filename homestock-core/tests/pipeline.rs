mod common;

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use common::{fetcher, store, zip_bytes, TestServer};
use homestock_core::pipeline::DownloadPhase;
use homestock_core::settings::default_worksheet_mapping;
use homestock_core::workbook::{
    CopyDataRequest, CopyDataResponse, CopyToOutputRequest, CopyToOutputResponse,
    RunFormulasRequest, RunFormulasResponse, SourceFile,
};
use homestock_core::{
    ConfirmationRequest, Error, FileType, PhaseResult, PipelineOrchestrator, Result, RunParams,
    WorkbookService,
};

/// Records every call and answers with success unless told otherwise.
#[derive(Default)]
struct RecordingWorkbook {
    calls: Mutex<Vec<&'static str>>,
    sources: Mutex<Vec<SourceFile>>,
    formulas_error: Option<String>,
    unreachable: bool,
}

impl RecordingWorkbook {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl WorkbookService for RecordingWorkbook {
    fn copy_data_to_excel(&self, request: &CopyDataRequest) -> Result<CopyDataResponse> {
        self.calls.lock().unwrap().push("copy_data_to_excel");
        if self.unreachable {
            return Err(Error::Workbook("workbook service is not running".to_string()));
        }
        *self.sources.lock().unwrap() = request.source_files.clone();
        Ok(CopyDataResponse {
            success: true,
            output_path: Some(request.output_path.clone()),
            worksheets: vec!["Eq Bhav".to_string()],
            error: None,
        })
    }

    fn run_formulas(&self, _request: &RunFormulasRequest) -> Result<RunFormulasResponse> {
        self.calls.lock().unwrap().push("run_formulas");
        Ok(match &self.formulas_error {
            Some(error) => RunFormulasResponse {
                success: false,
                formulas_executed: 0,
                error: Some(error.clone()),
            },
            None => RunFormulasResponse { success: true, formulas_executed: 42, error: None },
        })
    }

    fn copy_to_output(&self, request: &CopyToOutputRequest) -> Result<CopyToOutputResponse> {
        self.calls.lock().unwrap().push("copy_to_output");
        Ok(CopyToOutputResponse {
            success: true,
            output_path: Some(request.output_path.clone()),
            worksheets_copied: vec!["Eq Bhav".to_string(), "Eq Del".to_string()],
            error: None,
        })
    }
}

fn dec_1() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 12, 1).unwrap()
}

fn orchestrator(dir: &Path, workbook: RecordingWorkbook) -> PipelineOrchestrator<RecordingWorkbook> {
    PipelineOrchestrator::new(fetcher(store(dir)), workbook)
}

fn confirmation(dir: &Path, confirmed: bool) -> ConfirmationRequest {
    ConfirmationRequest {
        confirmed,
        start_date: dec_1(),
        end_date: dec_1(),
        raw_path: dir.join("raw"),
        template_path: None,
        intermediate_path: dir.join("intermediate").join("book.xlsx"),
        output_path: dir.join("output").join("final.xlsx"),
        worksheet_mapping: default_worksheet_mapping(),
        worksheets_to_output: None,
    }
}

/// Serves a bhavcopy archive and a delivery report for 2023-12-01.
fn serve_day(server: &TestServer, params: &mut RunParams) {
    server.serve(
        "/cm.zip",
        zip_bytes(&[("cm01DEC2023bhav.csv", "SYMBOL,SERIES,CLOSE\nTCS,EQ,3500\n")]),
    );
    server.serve("/MTO_01122023.DAT", "10,MTO,01122023\n20,1,TCS,EQ,100,80,80.00\n");
    params.overrides.set(FileType::CmBhavcopy, server.url("/cm.zip"));
    params.overrides.set(FileType::CmDelivery, server.url("/MTO_01122023.DAT"));
    params.file_types = vec![FileType::CmBhavcopy, FileType::CmDelivery];
}

#[test]
fn unreachable_url_is_missing_but_phase_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());

    let mut params = RunParams::new(dec_1(), dec_1(), dir.path().join("raw"));
    params.overrides.set(FileType::CmBhavcopy, "http://127.0.0.1:1/cm.zip");
    params.file_types = vec![FileType::CmBhavcopy];

    let DownloadPhase { success, downloaded, missing, message } =
        pipeline.run_download_phase(&params).unwrap();

    assert!(success);
    assert!(downloaded.is_empty());
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].file_type, FileType::CmBhavcopy);
    assert_eq!(missing[0].url, "http://127.0.0.1:1/cm.zip");
    assert_eq!(message, "Downloaded 0 files");
}

#[test]
fn one_missing_file_does_not_stop_its_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());

    let end = NaiveDate::from_ymd_opt(2023, 12, 2).unwrap();
    let mut params = RunParams::new(dec_1(), end, dir.path().join("raw"));
    serve_day(&server, &mut params);
    params.overrides.set(FileType::FoBhavcopy, server.url("/gone.zip"));
    params.file_types.push(FileType::FoBhavcopy);

    let phase = pipeline.run_download_phase(&params).unwrap();

    assert!(phase.success);
    // both dates map to the same overridden URLs
    assert_eq!(phase.downloaded.len(), 4);
    assert!(phase.downloaded.contains(&"cm_bhavcopy_2023-12-02.zip".to_string()));
    assert!(phase.downloaded.contains(&"cm_delivery_2023-12-01.DAT".to_string()));
    assert_eq!(phase.missing.len(), 2);
    assert!(phase.missing.iter().all(|m| m.file_type == FileType::FoBhavcopy));
}

#[test]
fn reversed_range_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());
    let start = NaiveDate::from_ymd_opt(2023, 12, 5).unwrap();

    let params = RunParams::new(start, dec_1(), dir.path().join("raw"));
    assert!(matches!(
        pipeline.run_until_confirmation(&params),
        Err(Error::InvalidDateRange { .. })
    ));
}

#[test]
fn run_stops_at_confirmation_barrier() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());

    let mut params = RunParams::new(dec_1(), dec_1(), dir.path().join("raw"));
    serve_day(&server, &mut params);

    let report = pipeline.run_until_confirmation(&params).unwrap();

    assert!(report.success);
    assert!(report.requires_confirmation);
    assert_eq!(report.phases.len(), 2);
    match &report.phases[1] {
        PhaseResult::Verification(phase) => {
            assert!(phase.success);
            assert!(phase.requires_confirmation);
            assert_eq!(phase.verified_count, 2);
            assert_eq!(phase.invalid_count, 0);
            assert_eq!(phase.message, "All 2 files verified successfully");
        }
        other => panic!("expected verification phase, got {:?}", other),
    }
    assert!(pipeline.workbook().calls().is_empty());
}

#[test]
fn corrupt_and_stray_files_are_flagged_for_review() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());

    server.serve("/cm.zip", "<html>Service Unavailable</html>");
    let mut params = RunParams::new(dec_1(), dec_1(), dir.path().join("raw"));
    params.overrides.set(FileType::CmBhavcopy, server.url("/cm.zip"));
    params.file_types = vec![FileType::CmBhavcopy];
    pipeline.run_download_phase(&params).unwrap();

    // placed by hand, no download record
    std::fs::write(dir.path().join("raw").join("fo_bhavcopy_2023-12-01.csv"), "").unwrap();

    let phase = pipeline
        .run_verification_phase(dec_1(), dec_1(), &dir.path().join("raw"))
        .unwrap();

    assert!(!phase.success);
    assert!(phase.requires_confirmation);
    assert_eq!(phase.invalid_count, 2);
    assert_eq!(phase.message, "Found 2 invalid files. Please review before proceeding.");

    let stray = phase
        .summary
        .invalid_files
        .iter()
        .find(|f| f.download_id.is_none())
        .unwrap();
    assert_eq!(stray.file_type, Some(FileType::FoBhavcopy));
    assert_eq!(stray.verification.error.as_deref(), Some("File is empty"));
}

#[test]
fn denied_confirmation_cancels_without_workbook_calls() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());

    let report = pipeline
        .continue_after_confirmation(&confirmation(dir.path(), false))
        .unwrap();

    assert!(!report.success);
    assert!(report.message.contains("cancelled"));
    assert!(report.phases.is_empty());
    assert!(pipeline.workbook().calls().is_empty());
}

#[test]
fn confirmed_run_publishes_verified_files() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start();
    let pipeline = orchestrator(dir.path(), RecordingWorkbook::default());

    let mut params = RunParams::new(dec_1(), dec_1(), dir.path().join("raw"));
    serve_day(&server, &mut params);
    pipeline.run_until_confirmation(&params).unwrap();

    let report = pipeline
        .continue_after_confirmation(&confirmation(dir.path(), true))
        .unwrap();

    assert!(report.success, "{}", report.message);
    assert_eq!(report.message, "Successfully created output file: final.xlsx");
    assert_eq!(report.output_path, Some(dir.path().join("output").join("final.xlsx")));
    assert_eq!(
        pipeline.workbook().calls(),
        vec!["copy_data_to_excel", "run_formulas", "copy_to_output"]
    );

    let sheets: BTreeMap<FileType, Option<String>> = pipeline
        .workbook()
        .sources
        .lock()
        .unwrap()
        .iter()
        .map(|source| (source.file_type.unwrap(), source.worksheet_name.clone()))
        .collect();
    assert_eq!(sheets[&FileType::CmBhavcopy].as_deref(), Some("Eq Bhav"));
    assert_eq!(sheets[&FileType::CmDelivery].as_deref(), Some("Eq Del"));

    match &report.phases[0] {
        PhaseResult::TransformAndPublish(phase) => {
            assert_eq!(phase.formulas_executed, 42);
            assert_eq!(phase.worksheets, vec!["Eq Bhav", "Eq Del"]);
        }
        other => panic!("expected publish phase, got {:?}", other),
    }
}

#[test]
fn reported_workbook_failure_is_surfaced_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let workbook = RecordingWorkbook {
        formulas_error: Some("Formula engine crashed".to_string()),
        ..RecordingWorkbook::default()
    };
    let pipeline = orchestrator(dir.path(), workbook);

    let report = pipeline
        .continue_after_confirmation(&confirmation(dir.path(), true))
        .unwrap();

    assert!(!report.success);
    assert_eq!(pipeline.workbook().calls(), vec!["copy_data_to_excel", "run_formulas"]);
    match &report.phases[0] {
        PhaseResult::TransformAndPublish(phase) => {
            assert_eq!(
                phase.error.as_deref(),
                Some("Failed to run formulas: Formula engine crashed")
            );
        }
        other => panic!("expected publish phase, got {:?}", other),
    }
}

#[test]
fn unreachable_workbook_service_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let workbook = RecordingWorkbook { unreachable: true, ..RecordingWorkbook::default() };
    let pipeline = orchestrator(dir.path(), workbook);

    let err = pipeline
        .continue_after_confirmation(&confirmation(dir.path(), true))
        .unwrap_err();
    assert!(matches!(err, Error::Workbook(ref msg) if msg == "workbook service is not running"));
}
