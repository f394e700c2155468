//! Batch hydration against the in-memory executor.

mod common;

use common::*;
use relmodel::{
    AssociationErrorKind, AssociationSlot, Cx, PreloadNode, PreloadTree, Record, Session, Value,
};

struct Blog {
    session: Session<MemoryExecutor>,
    executor: MemoryExecutor,
}

impl Blog {
    fn new() -> Self {
        let executor = MemoryExecutor::new();
        let log = EventLog::default();
        Self {
            session: Session::new(blog_schema(&log), executor.clone()),
            executor,
        }
    }

    async fn user(&self, cx: &Cx, name: &str) -> Record {
        unwrap_outcome(self.session.create(cx, "User", [("name", name)], None).await)
    }

    async fn post(&self, cx: &Cx, user: &Record, title: &str) -> Record {
        let attrs: Vec<(&str, Value)> = vec![("userId", user.id().clone()), ("title", title.into())];
        unwrap_outcome(self.session.create(cx, "Post", attrs, None).await)
    }

    async fn comment(&self, cx: &Cx, post: &Record, body: &str) -> Record {
        let attrs: Vec<(&str, Value)> = vec![("postId", post.id().clone()), ("body", body.into())];
        unwrap_outcome(self.session.create(cx, "Comment", attrs, None).await)
    }
}

fn titles(record: &Record, association: &str) -> Vec<String> {
    record
        .many(association)
        .expect("collection loaded")
        .iter()
        .map(|r| r.get("title").and_then(Value::as_str).unwrap_or_default().to_string())
        .collect()
}

#[test]
fn has_many_preload_is_one_query_for_all_owners() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let bob = blog.user(&cx, "bob").await;
        blog.user(&cx, "cy").await;
        blog.post(&cx, &ada, "a1").await;
        blog.post(&cx, &bob, "b1").await;
        blog.post(&cx, &ada, "a2").await;
        blog.executor.clear_log();

        let users = unwrap_outcome(blog.session.query("User").preload("posts").all(&cx).await);
        assert_eq!(blog.executor.select_count(), 2);
        assert!(selects(&blog.executor)[1].contains("posts.\"userId\" IN (1, 2, 3)"));

        assert_eq!(titles(&users[0], "posts"), vec!["a1", "a2"]);
        assert_eq!(titles(&users[1], "posts"), vec!["b1"]);
        assert!(users[2].many("posts").unwrap().is_empty());
        assert!(users.iter().all(|u| u.many("posts").unwrap().is_frozen()));
    });
}

#[test]
fn nested_preload_costs_one_query_per_level() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let bob = blog.user(&cx, "bob").await;
        let p1 = blog.post(&cx, &ada, "a1").await;
        let p2 = blog.post(&cx, &bob, "b1").await;
        blog.comment(&cx, &p1, "first").await;
        blog.comment(&cx, &p2, "second").await;
        blog.comment(&cx, &p2, "third").await;
        blog.executor.clear_log();

        let users = unwrap_outcome(
            blog.session
                .query("User")
                .preload("posts.comments")
                .all(&cx)
                .await,
        );
        // root + posts + comments
        assert_eq!(blog.executor.select_count(), 3);
        let bob_posts = users[1].many("posts").unwrap();
        let comments = bob_posts.first().unwrap().many("comments").unwrap();
        assert_eq!(comments.len(), 2);
    });
}

#[test]
fn loaded_collections_are_frozen_and_never_duplicated() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let post = blog.post(&cx, &ada, "a1").await;
        blog.comment(&cx, &post, "hi").await;

        let mut users = unwrap_outcome(blog.session.query("User").preload("posts").all(&cx).await);
        blog.executor.clear_log();

        // Overlapping second preload: posts stay as loaded, only comments are fetched.
        unwrap_outcome(blog.session.load(&cx, &mut users, "posts.comments", None).await);
        assert_eq!(blog.executor.select_count(), 1);
        assert_eq!(users[0].many("posts").unwrap().len(), 1);
        let first = users[0].many("posts").unwrap().first().unwrap();
        assert_eq!(first.many("comments").unwrap().len(), 1);

        let Some(AssociationSlot::Many(posts)) = users[0].association_mut("posts") else {
            panic!("posts should be a loaded collection");
        };
        let err = posts.push(post.clone()).unwrap_err();
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::FrozenCollection)
        );
    });
}

#[test]
fn belongs_to_preload_batches_distinct_keys() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let bob = blog.user(&cx, "bob").await;
        blog.post(&cx, &ada, "a1").await;
        blog.post(&cx, &ada, "a2").await;
        blog.post(&cx, &bob, "b1").await;
        blog.executor.clear_log();

        let posts = unwrap_outcome(blog.session.query("Post").preload("user").all(&cx).await);
        assert_eq!(blog.executor.select_count(), 2);
        assert!(selects(&blog.executor)[1].contains("users.\"id\" IN (1, 2)"));
        let owners: Vec<&str> = posts
            .iter()
            .map(|p| {
                p.one("user")
                    .unwrap()
                    .and_then(|u| u.get("name"))
                    .and_then(Value::as_str)
                    .unwrap()
            })
            .collect();
        assert_eq!(owners, vec!["ada", "ada", "bob"]);
    });
}

#[test]
fn polymorphic_belongs_to_issues_one_query_per_target_type() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let post = blog.post(&cx, &ada, "a1").await;
        for (owner, kind, url) in [(&ada, "User", "avatar.png"), (&post, "Post", "cover.png")] {
            let attrs: Vec<(&str, Value)> = vec![
                ("imageableId", owner.id().clone()),
                ("imageableType", kind.into()),
                ("url", url.into()),
            ];
            unwrap_outcome(blog.session.create(&cx, "Image", attrs, None).await);
        }
        blog.executor.clear_log();

        let images = unwrap_outcome(blog.session.query("Image").preload("imageable").all(&cx).await);
        assert_eq!(blog.executor.select_count(), 3);
        let targets: Vec<&str> = images
            .iter()
            .map(|i| i.one("imageable").unwrap().unwrap().model_name())
            .collect();
        assert_eq!(targets, vec!["User", "Post"]);

        // A discriminator filter narrows the sources before any target query.
        blog.executor.clear_log();
        let mut images = images;
        for image in &mut images {
            image.unload_all();
        }
        let node = PreloadNode::new("imageable").filter(relmodel::Filter::eq("imageableType", "Post"));
        unwrap_outcome(blog.session.load(&cx, &mut images, PreloadTree::from(node), None).await);
        assert_eq!(blog.executor.select_count(), 1);
        assert!(images[0].one("imageable").unwrap().is_none());
        assert_eq!(images[1].one("imageable").unwrap().unwrap().model_name(), "Post");
    });
}

#[test]
fn polymorphic_has_many_constrains_the_discriminator() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let post = blog.post(&cx, &ada, "a1").await;
        assert_eq!(ada.id(), post.id());
        for (kind, url) in [("User", "avatar.png"), ("Post", "cover.png")] {
            let attrs: Vec<(&str, Value)> = vec![
                ("imageableId", Value::BigInt(1)),
                ("imageableType", kind.into()),
                ("url", url.into()),
            ];
            unwrap_outcome(blog.session.create(&cx, "Image", attrs, None).await);
        }

        let users = unwrap_outcome(blog.session.query("User").preload("images").all(&cx).await);
        let urls: Vec<&str> = users[0]
            .many("images")
            .unwrap()
            .iter()
            .filter_map(|i| i.get("url").and_then(Value::as_str))
            .collect();
        assert_eq!(urls, vec!["avatar.png"]);
    });
}

#[test]
fn through_preload_walks_each_hop() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let bob = blog.user(&cx, "bob").await;
        let a1 = blog.post(&cx, &ada, "a1").await;
        let a2 = blog.post(&cx, &ada, "a2").await;
        let b1 = blog.post(&cx, &bob, "b1").await;
        blog.comment(&cx, &a1, "one").await;
        blog.comment(&cx, &a2, "two").await;
        blog.comment(&cx, &b1, "three").await;
        blog.executor.clear_log();

        let users = unwrap_outcome(blog.session.query("User").preload("comments").all(&cx).await);
        // root + posts hop + comments hop
        assert_eq!(blog.executor.select_count(), 3);
        let bodies = |user: &Record| -> Vec<String> {
            user.many("comments")
                .unwrap()
                .iter()
                .filter_map(|c| c.get("body").and_then(Value::as_str).map(str::to_string))
                .collect()
        };
        assert_eq!(bodies(&users[0]), vec!["one", "two"]);
        assert_eq!(bodies(&users[1]), vec!["three"]);
        // The intermediate hop lands in the owners' own slots.
        assert_eq!(titles(&users[0], "posts"), vec!["a1", "a2"]);
        assert!(users[0].many("posts").unwrap().is_frozen());
        let first = users[0].many("posts").unwrap().first().unwrap();
        assert_eq!(first.many("comments").unwrap().len(), 1);
    });
}

#[test]
fn through_preload_reuses_an_intermediate_loaded_alongside() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let a1 = blog.post(&cx, &ada, "a1").await;
        blog.comment(&cx, &a1, "one").await;
        blog.executor.clear_log();

        let tree = PreloadTree::new().include("posts").include("comments");
        let users = unwrap_outcome(blog.session.query("User").preload(tree).all(&cx).await);
        // root + posts + comments: the through association queries no posts of its own
        assert_eq!(blog.executor.select_count(), 3);
        assert_eq!(users[0].many("comments").unwrap().len(), 1);
        assert_eq!(titles(&users[0], "posts"), vec!["a1"]);
    });
}

#[test]
fn undeclared_association_fails_before_querying() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        blog.user(&cx, "ada").await;
        blog.executor.clear_log();
        let err = expect_err(blog.session.query("User").preload("followers").all(&cx).await);
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::MissingAssociation)
        );
        // Only the root query ran.
        assert_eq!(blog.executor.select_count(), 1);
    });
}

#[test]
fn reading_an_unloaded_slot_fails() {
    let cx = Cx::for_testing();
    let blog = Blog::new();

    block_on(async {
        let ada = blog.user(&cx, "ada").await;
        let err = ada.many("posts").unwrap_err();
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::NotLoadedAssociation)
        );
    });
}
