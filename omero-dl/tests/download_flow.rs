use omero_core::{DatasetId, ImageId, MemoryRepository, OmeroClient, ProjectId};
use omero_dl::download::Tick;
use omero_dl::explorer::load_explorer;
use omero_dl::hierarchy::Entity;
use omero_dl::highlight::Highlight;
use omero_dl::session::Session;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_json(server: &MockServer, route: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(query_param("bsession", "s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

// P1 { D1 { I1, I2 } } where both images belong to fileset 77.
async fn mount_shared_fileset(server: &MockServer) {
    mount_json(
        server,
        "/api/v0/m/projects/",
        json!({ "meta": { "totalCount": 1 }, "data": [ { "@id": 1, "Name": "P1" } ] }),
    )
    .await;
    mount_json(
        server,
        "/api/v0/m/projects/1/datasets/",
        json!({ "meta": { "totalCount": 1 }, "data": [ { "@id": 10, "Name": "D1" } ] }),
    )
    .await;
    mount_json(
        server,
        "/api/v0/m/datasets/10/images/",
        json!({
            "meta": { "totalCount": 2 },
            "data": [ { "@id": 100, "Name": "I1" }, { "@id": 101, "Name": "I2" } ]
        }),
    )
    .await;
    mount_json(
        server,
        "/webclient/api/annotations/",
        json!({ "annotations": [] }),
    )
    .await;
    for image in [100, 101] {
        mount_json(
            server,
            &format!("/api/v0/m/images/{image}/fileset/"),
            json!({
                "data": {
                    "@id": 77,
                    "files": [ { "@id": 500, "Name": "scan.czi", "Size": 11 } ]
                }
            }),
        )
        .await;
    }
    Mock::given(method("GET"))
        .and(path("/webgateway/original_file/500/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello omero".to_vec()))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn shared_fileset_is_downloaded_once_over_http() {
    let server = MockServer::start().await;
    mount_shared_fileset(&server).await;
    let client = OmeroClient::with_base_url(&server.uri(), "s3cret").unwrap();
    let dir = tempdir().unwrap();

    let explorer = load_explorer(&client).await.unwrap();
    let mut session = Session::new(explorer);
    session
        .select_entity(&Entity::Project(ProjectId(1)), &client)
        .await
        .unwrap();
    let project = session.explorer().roots()[0];
    assert_eq!(session.highlights().get(project), Highlight::Full);

    let mut run = session.start_download(&client, dir.path()).await.unwrap();
    assert_eq!(run.progress().overall_total, 1);
    let mut completed = Vec::new();
    while let Some(tick) = run.step().await.unwrap() {
        if let Tick::FilesetCompleted { completed: done, total, .. } = tick {
            completed.push((done, total));
        }
    }
    drop(run);

    assert_eq!(completed, vec![(1, 1)]);
    assert_eq!(
        std::fs::read(dir.path().join("P1/D1/scan.czi")).unwrap(),
        b"hello omero"
    );

    session.finish_download().unwrap();
    assert!(session.queue().is_empty());
    assert_eq!(session.highlights().get(project), Highlight::None);
}

#[tokio::test]
async fn incremental_selection_grows_the_same_queue_branch() {
    let mut repo = MemoryRepository::new();
    repo.add_project(1, "P1")
        .add_dataset(1, 10, "D1")
        .add_dataset(1, 11, "D2")
        .add_image(10, 100, "I1")
        .add_image(10, 101, "I2")
        .add_image(11, 110, "I3")
        .set_upload_folder(101, "run-2")
        .link_fileset(100, 1)
        .link_fileset(101, 2)
        .link_fileset(110, 3)
        .add_file(1, "i1.tif", b"one")
        .add_file(2, "i2.tif", b"two")
        .add_file(3, "i3.tif", b"three");

    let explorer = load_explorer(&repo).await.unwrap();
    let mut session = Session::new(explorer);
    for entity in [
        Entity::Image(ImageId(101)),
        Entity::Dataset(DatasetId(11)),
        Entity::Image(ImageId(100)),
    ] {
        session.select_entity(&entity, &repo).await.unwrap();
    }

    let queue = session.queue().tree();
    assert_eq!(queue.roots().len(), 1);
    assert_eq!(queue.children_of(Some(queue.roots()[0])).len(), 2);
    let project = session.explorer().roots()[0];
    assert_eq!(session.highlights().get(project), Highlight::Full);

    let dir = tempdir().unwrap();
    let mut run = session.start_download(&repo, dir.path()).await.unwrap();
    let state = run.run_to_end().await.unwrap();
    drop(run);

    assert_eq!(state.overall_completed, 3);
    let root = dir.path().join("P1");
    assert_eq!(std::fs::read(root.join("D1/run-2/i2.tif")).unwrap(), b"two");
    assert_eq!(std::fs::read(root.join("D1/i1.tif")).unwrap(), b"one");
    assert_eq!(std::fs::read(root.join("D2/i3.tif")).unwrap(), b"three");
}
