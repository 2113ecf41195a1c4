//! biq wire protocol: framing, tag-value items and report/response codecs.

mod frame;
mod report;
mod response;
mod values;

pub use frame::{
    checksum, encode_frame, split_frame, status, FrameHeader, HEADER_LEN, PROTO_V1, PROTO_V2,
    PROTO_V3, RESPONSE_VERSION,
};
pub use report::{
    decode_report, BatchRecord, BatchReport, DecodedRecord, TaggedReport, BATCH_HEADER_LEN,
    BATCH_RECORD_LEN,
};
pub use response::Response;
pub use values::{
    decode_values, encode_values, ReportTag, ReportValue, ResponseTag, ResponseValue,
    TaggedValue, FW_URL_PLACEHOLDER,
};
