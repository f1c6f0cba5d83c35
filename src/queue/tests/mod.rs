use super::test_helpers::*;
use crate::error::{Error, UploadError};
use crate::types::*;
use std::sync::atomic::Ordering;
use std::time::Duration;
