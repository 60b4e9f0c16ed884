#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
use prop::string::string_regex;
use proptest::prelude::*;
use proptest::{collection::vec, option, strategy::Strategy};

use crate::format::{ChunkIndices, ObjectId, Schema, Token};
use crate::selection::{Selection, SliceDim};

const MAX_NDIM: usize = 4;

pub fn schemas() -> BoxedStrategy<Schema> {
    prop_oneof![Just(Schema::V1), Just(Schema::V2)].boxed()
}

pub fn tokens() -> impl Strategy<Value = Token> {
    (schemas(), string_regex("[0-9a-f]{32}").expect("invalid regex"))
        .prop_map(|(schema, hex)| Token::from_hex(schema, &hex).expect("invalid token"))
}

prop_compose! {
    pub fn v2_roots()(hex in string_regex("[0-9a-f]{32}").expect("invalid regex")) -> ObjectId {
        let token = Token::from_hex(Schema::V2, &hex).expect("invalid token");
        ObjectId::Group(token.rooted())
    }
}

pub fn domains() -> impl Strategy<Value = ObjectId> {
    vec(string_regex("[a-zA-Z0-9_.]{1,12}").expect("invalid regex"), 1..5).prop_map(|parts| {
        ObjectId::domain(&format!("/{}", parts.join("/"))).expect("invalid domain")
    })
}

prop_compose! {
    pub fn chunk_ids()(
        token in tokens(),
        coord in vec(0u64..10_000, 1..=MAX_NDIM),
        partition in option::of(0u32..64),
    ) -> ObjectId {
        // partitions only exist for v2 chunk keys
        let partition = partition.filter(|_| token.schema() == Schema::V2);
        ObjectId::Chunk { token, partition, coord: ChunkIndices(coord) }
    }
}

pub fn object_ids() -> impl Strategy<Value = ObjectId> {
    prop_oneof![
        tokens().prop_map(ObjectId::Group),
        tokens().prop_map(ObjectId::Dataset),
        tokens().prop_map(ObjectId::Datatype),
        chunk_ids(),
        domains(),
    ]
}

fn slice_dims(extent: u64) -> impl Strategy<Value = SliceDim> {
    (0..extent).prop_flat_map(move |start| {
        (Just(start), start + 1..=extent, 1..=extent)
            .prop_map(|(start, stop, step)| SliceDim::new(start, stop, step))
    })
}

prop_compose! {
    /// A dataset shape, a selection within it and a chunk shape.
    pub fn selections_with_chunks()(
        shape in vec(1u64..40, 1..=3)
    )(
        dims in shape.iter().map(|e| slice_dims(*e)).collect::<Vec<_>>(),
        chunks in shape.iter().map(|e| 1..=*e).collect::<Vec<_>>(),
        shape in Just(shape),
    ) -> (Vec<u64>, Selection, Vec<u64>) {
        (shape, Selection(dims), chunks)
    }
}
