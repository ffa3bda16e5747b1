//! The default codec.

use crate::codec::doc_values::PackedDocValuesFormat;
use crate::codec::dv_updates::NumericUpdatesFormat;
use crate::codec::field_infos_format::SimpleFieldInfosFormat;
use crate::codec::live_docs::BitsLiveDocsFormat;
use crate::codec::postings::BlockTreePostingsFormat;
use crate::codec::segment_info_format::SimpleSegmentInfoFormat;
use crate::codec::stored_fields::SimpleStoredFieldsFormat;
use crate::codec::vectors::FlatVectorsFormat;
use crate::codec::{
    Codec, DocValuesFormat, DocValuesUpdatesFormat, FieldInfosFormat, LiveDocsFormat,
    PostingsFormat, SegmentInfoFormat, StoredFieldsFormat, VectorsFormat,
};

/// Block-tree postings, packed doc values and flat vectors.
#[derive(Debug, Default)]
pub struct Tessera10Codec {
    postings: BlockTreePostingsFormat,
    stored_fields: SimpleStoredFieldsFormat,
    doc_values: PackedDocValuesFormat,
    vectors: FlatVectorsFormat,
    field_infos: SimpleFieldInfosFormat,
    segment_info: SimpleSegmentInfoFormat,
    live_docs: BitsLiveDocsFormat,
    dv_updates: NumericUpdatesFormat,
}

impl Tessera10Codec {
    pub fn new() -> Self {
        Tessera10Codec::default()
    }
}

impl Codec for Tessera10Codec {
    fn name(&self) -> &str {
        "Tessera10"
    }

    fn postings_format(&self) -> &dyn PostingsFormat {
        &self.postings
    }

    fn stored_fields_format(&self) -> &dyn StoredFieldsFormat {
        &self.stored_fields
    }

    fn doc_values_format(&self) -> &dyn DocValuesFormat {
        &self.doc_values
    }

    fn vectors_format(&self) -> &dyn VectorsFormat {
        &self.vectors
    }

    fn field_infos_format(&self) -> &dyn FieldInfosFormat {
        &self.field_infos
    }

    fn segment_info_format(&self) -> &dyn SegmentInfoFormat {
        &self.segment_info
    }

    fn live_docs_format(&self) -> &dyn LiveDocsFormat {
        &self.live_docs
    }

    fn doc_values_updates_format(&self) -> &dyn DocValuesUpdatesFormat {
        &self.dv_updates
    }
}
