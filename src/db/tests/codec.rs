use crate::db::*;
use crate::error::{DatabaseError, Error};
use crate::types::*;

fn sample_record() -> TaskRecord {
    TaskRecord {
        id: TaskId(12),
        target_url: "https://uploads.example.com/v1/files".to_string(),
        file_reference: "file:///data/photo.jpg".to_string(),
        mime_type: Some("image/jpeg".to_string()),
        title: Some("Holiday".to_string()),
        description: None,
        user_agent: Some("custom/1.0".to_string()),
        field_name: Some("upload".to_string()),
        status: Status::WaitingToRetry,
        num_failed: 2,
        retry_after_seconds: 60,
        total_bytes: 4096,
        current_bytes: 1024,
        last_modified_at_millis: 1_700_000_000_123,
        created_at_millis: 1_700_000_000_000,
        visibility: Visibility::VisibleNotifyOnlyCompletion,
        control: Control::Paused,
        allow_roaming: false,
        allow_metered: true,
        deleted: false,
        server_response: None,
        error_message: Some("unhandled HTTP response: 503 Service Unavailable".to_string()),
        request_headers: vec![
            ("Authorization".to_string(), "Bearer t".to_string()),
            ("X-Trace".to_string(), "abc".to_string()),
        ],
        form_fields: vec![("album".to_string(), "2024".to_string())],
    }
}

#[test]
fn test_record_survives_row_encoding() {
    let record = sample_record();
    let row = TaskRow::try_from(&record).unwrap();

    assert_eq!(row.status, 2);
    assert_eq!(row.visibility, 3);
    assert_eq!(row.control, 1);
    assert_eq!(
        row.request_headers,
        r#"[["Authorization","Bearer t"],["X-Trace","abc"]]"#
    );

    let decoded = TaskRecord::try_from(row).unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn test_header_order_is_preserved() {
    let mut record = sample_record();
    record.request_headers = vec![
        ("Z".to_string(), "1".to_string()),
        ("A".to_string(), "2".to_string()),
        ("M".to_string(), "3".to_string()),
    ];
    let decoded = TaskRecord::try_from(TaskRow::try_from(&record).unwrap()).unwrap();
    let names: Vec<_> = decoded
        .request_headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(names, ["Z", "A", "M"]);
}

#[test]
fn test_malformed_json_is_reported_as_corrupt() {
    let mut row = TaskRow::try_from(&sample_record()).unwrap();
    row.form_fields = "{not json".to_string();

    match TaskRecord::try_from(row) {
        Err(Error::Database(DatabaseError::CorruptRecord { id, reason })) => {
            assert_eq!(id, 12);
            assert!(reason.starts_with("form_fields"));
        }
        other => panic!("expected CorruptRecord, got {other:?}"),
    }
}

#[test]
fn test_negative_counter_is_reported_as_corrupt() {
    let mut row = TaskRow::try_from(&sample_record()).unwrap();
    row.num_failed = -1;
    assert!(matches!(
        TaskRecord::try_from(row),
        Err(Error::Database(DatabaseError::CorruptRecord { .. }))
    ));
}

#[test]
fn test_unknown_enum_codes_are_reported_as_corrupt() {
    let mut row = TaskRow::try_from(&sample_record()).unwrap();
    row.status = 42;
    match TaskRecord::try_from(row) {
        Err(Error::Database(DatabaseError::CorruptRecord { id, reason })) => {
            assert_eq!(id, 12);
            assert!(reason.contains("status"));
        }
        other => panic!("expected CorruptRecord, got {other:?}"),
    }

    let mut row = TaskRow::try_from(&sample_record()).unwrap();
    row.visibility = 4;
    assert!(matches!(
        TaskRecord::try_from(row),
        Err(Error::Database(DatabaseError::CorruptRecord { .. }))
    ));

    let mut row = TaskRow::try_from(&sample_record()).unwrap();
    row.control = 7;
    assert!(matches!(
        TaskRecord::try_from(row),
        Err(Error::Database(DatabaseError::CorruptRecord { .. }))
    ));
}
