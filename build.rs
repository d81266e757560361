fn main() {
    // The app callback service is declared by hand (no `.proto` file); the
    // message types live in `src/delivery/grpc.rs`.
    let service = tonic_build::manual::Service::builder()
        .name("AppCallback")
        .package("sidecar.runtime.v1")
        .method(
            tonic_build::manual::Method::builder()
                .name("on_topic_event")
                .route_name("OnTopicEvent")
                .input_type("crate::delivery::grpc::TopicEventRequest")
                .output_type("crate::delivery::grpc::TopicEventResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
